pub mod actor;
pub mod handler;
pub mod protocol;

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::store::models::DeviceSnapshot;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system clone this to push frames to one device.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Server-side keepalive for device connections.
///
/// Every `ping_interval` the server pings the device; a device that does not
/// answer within `pong_timeout` is disconnected and unregistered. A zero
/// `ping_interval` turns the keepalive off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Liveness {
    pub fn from_secs(ping_interval: u64, pong_timeout: u64) -> Self {
        Self {
            ping_interval: Duration::from_secs(ping_interval),
            pong_timeout: Duration::from_secs(pong_timeout),
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::from_secs(30, 10)
    }
}

/// Result of pushing a snapshot to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    NotConnected,
}

/// Connection registry: maps a device's MAC address to its live connection.
///
/// One entry per device. Registering the same MAC again replaces the previous
/// sender without closing it; the old connection simply stops receiving pushes.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, ConnectionSender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the connection for `mac_address`.
    /// Returns the sender that was replaced, if any.
    pub fn register(&self, mac_address: &str, tx: ConnectionSender) -> Option<ConnectionSender> {
        let previous = self.connections.insert(mac_address.to_string(), tx.clone());

        match &previous {
            Some(old) if !old.same_channel(&tx) => {
                tracing::warn!(
                    mac_address = %mac_address,
                    "Device re-registered from a new connection, previous connection no longer tracked"
                );
            }
            Some(_) => {}
            None => {
                tracing::debug!(
                    mac_address = %mac_address,
                    connections = self.connections.len(),
                    "Device registered"
                );
            }
        }

        previous
    }

    /// Current connection for `mac_address`, if any.
    pub fn lookup(&self, mac_address: &str) -> Option<ConnectionSender> {
        self.connections.get(mac_address).map(|entry| entry.value().clone())
    }

    /// Remove the entry whose value is `tx`. Returns the MAC it was registered under.
    ///
    /// A connection is only ever registered under one MAC, so at most one entry matches.
    pub fn unregister_by_channel(&self, tx: &ConnectionSender) -> Option<String> {
        let matching: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.value().same_channel(tx))
            .map(|entry| entry.key().clone())
            .collect();

        debug_assert!(
            matching.len() <= 1,
            "connection registered under several devices: {:?}",
            matching
        );
        if matching.len() > 1 {
            tracing::error!(
                devices = ?matching,
                "Connection was registered under several devices, removing all"
            );
        }

        let mut removed = None;
        for mac_address in matching {
            // Only remove if the entry still points at this connection; a reconnect
            // may have replaced it since the scan.
            if self
                .connections
                .remove_if(&mac_address, |_, sender| sender.same_channel(tx))
                .is_some()
            {
                tracing::debug!(mac_address = %mac_address, "Device unregistered");
                removed.get_or_insert(mac_address);
            }
        }
        removed
    }

    /// Push `snapshot` to the device as a JSON text frame.
    ///
    /// A missing or closed connection reports `NotConnected`; a closed one is
    /// dropped from the registry.
    pub fn send(&self, mac_address: &str, snapshot: &DeviceSnapshot) -> DeliveryOutcome {
        let Some(tx) = self.lookup(mac_address) else {
            return DeliveryOutcome::NotConnected;
        };

        let payload = match serde_json::to_string(snapshot) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(mac_address = %mac_address, error = %e, "Failed to encode snapshot");
                return DeliveryOutcome::NotConnected;
            }
        };

        if tx.send(Message::Text(payload.into())).is_err() {
            self.connections
                .remove_if(mac_address, |_, sender| sender.same_channel(&tx));
            tracing::debug!(mac_address = %mac_address, "Dropped closed connection");
            return DeliveryOutcome::NotConnected;
        }

        DeliveryOutcome::Delivered
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// MAC addresses with a tracked connection, in no particular order.
    pub fn connected_devices(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }
}
