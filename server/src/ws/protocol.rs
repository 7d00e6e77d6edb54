//! Device sync protocol: one [`Session`] per WebSocket connection.
//!
//! A session starts `Unidentified` and says nothing until the device speaks.
//! The first message carrying a `macAddress` identifies the device: the server
//! answers with the stored snapshot (if the device is known) and registers the
//! connection under that MAC. Malformed input is logged and ignored; only a
//! transport-level close ends the session.

use axum::extract::ws::Message;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::state::AppState;
use crate::store::{self, models::DeviceSnapshot, StorePool};
use crate::ws::{ConnectionRegistry, ConnectionSender};

/// Inbound messages the session could not act on. Never fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("binary frame is not valid UTF-8")]
    NotUtf8,

    #[error("connection already identified as {current}, ignoring {received}")]
    IdentityMismatch { current: String, received: String },
}

/// The part of a device message the server reads. Other fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHello {
    #[serde(default)]
    pub mac_address: Option<String>,
}

/// Decode a device message. Anything that is not a JSON object is rejected.
pub fn decode_hello(text: &str) -> Result<DeviceHello, ProtocolError> {
    let object: Map<String, Value> = serde_json::from_str(text)?;
    Ok(serde_json::from_value(Value::Object(object))?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unidentified,
    Identified(String),
    Closed,
}

/// Per-connection protocol state.
///
/// Dropping a session that was not explicitly closed closes it, so the registry
/// entry is removed exactly once however the connection loop ends.
pub struct Session {
    state: SessionState,
    tx: ConnectionSender,
    store: StorePool,
    registry: ConnectionRegistry,
}

impl Session {
    pub fn new(tx: ConnectionSender, app: &AppState) -> Self {
        Self {
            state: SessionState::Unidentified,
            tx,
            store: app.store.clone(),
            registry: app.connections.clone(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn mac_address(&self) -> Option<&str> {
        match &self.state {
            SessionState::Identified(mac) => Some(mac),
            _ => None,
        }
    }

    pub async fn handle_binary(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        self.handle_text(text).await
    }

    pub async fn handle_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        let hello = decode_hello(text)?;

        let Some(mac_address) = hello.mac_address.filter(|m| !m.is_empty()) else {
            tracing::debug!("Message without macAddress ignored");
            return Ok(());
        };

        match &self.state {
            SessionState::Unidentified => {}
            SessionState::Identified(current) if *current == mac_address => {
                self.registry.register(&mac_address, self.tx.clone());
                return Ok(());
            }
            SessionState::Identified(current) => {
                return Err(ProtocolError::IdentityMismatch {
                    current: current.clone(),
                    received: mac_address,
                });
            }
            SessionState::Closed => return Ok(()),
        }

        match store::fetch_snapshot(&self.store, &mac_address).await {
            Ok(Some(snapshot)) => {
                send_snapshot(&self.tx, &snapshot);
                tracing::info!(mac_address = %mac_address, "Sent initial state to device");
            }
            Ok(None) => {
                tracing::info!(mac_address = %mac_address, "Device not found in state store");
            }
            Err(e) => {
                tracing::warn!(
                    mac_address = %mac_address,
                    error = %e,
                    "State lookup failed, registering without snapshot"
                );
            }
        }

        self.registry.register(&mac_address, self.tx.clone());
        tracing::info!(mac_address = %mac_address, "Device registered");
        self.state = SessionState::Identified(mac_address);
        Ok(())
    }

    /// Move to `Closed` and drop the registry entry for this connection.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mac_address) = self.registry.unregister_by_channel(&self.tx) {
            tracing::info!(mac_address = %mac_address, "Device disconnected");
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Queue a snapshot as a JSON text frame on the connection's writer.
fn send_snapshot(tx: &ConnectionSender, snapshot: &DeviceSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(payload) => {
            let _ = tx.send(Message::Text(payload.into()));
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode snapshot"),
    }
}
