//! Typed records of the persisted state document.
//!
//! Field names follow the on-disk JSON (`macAddress`, `userAssociated`, ...).
//! Every record carries a flattened `extra` map so fields this server does not
//! interpret survive a read-modify-write untouched. The color and sound fields
//! and the join keys are kept as raw JSON values: they must be present but any
//! JSON type is accepted, so one odd record never makes the whole document
//! unreadable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The whole persisted document: `{ "users": [...], "devices": [...] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StateDocument {
    pub fn find_user(&self, username: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn find_device(&self, mac_address: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.mac_address == mac_address)
    }

    /// Device owned by `user`, joined on `user.associatedUser == device.userAssociated`.
    /// A user without a join key owns no device.
    pub fn device_for_user_mut(&mut self, user: &UserRecord) -> Option<&mut DeviceRecord> {
        if user.associated_user.is_null() {
            return None;
        }
        self.devices
            .iter_mut()
            .find(|d| d.user_associated == user.associated_user)
    }
}

/// User record. Read-only from the server's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub username: String,
    #[serde(default)]
    pub associated_user: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Device record, keyed by hardware address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub mac_address: String,
    #[serde(default)]
    pub user_associated: Value,
    #[serde(default)]
    pub last_message: String,
    pub r: Value,
    pub g: Value,
    pub b: Value,
    pub sound: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceRecord {
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            mac_address: self.mac_address.clone(),
            last_message: self.last_message.clone(),
            r: self.r.clone(),
            g: self.g.clone(),
            b: self.b.clone(),
            sound: self.sound.clone(),
        }
    }
}

/// Full device state as sent to the device on identification and on every push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub mac_address: String,
    pub last_message: String,
    pub r: Value,
    pub g: Value,
    pub b: Value,
    pub sound: Value,
}
