use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Resource};
use crate::state::AppState;
use crate::store::{models::DeviceSnapshot, StoreError};
use crate::ws::DeliveryOutcome;

#[derive(Debug, Deserialize)]
pub struct UpdateDeviceRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Identity and new message of the device that was updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedDevice {
    pub mac_address: String,
    pub last_message: String,
}

#[derive(Debug, Serialize)]
pub struct UpdateDeviceResponse {
    pub message: String,
    pub device: UpdatedDevice,
}

/// Set `lastMessage` on the device associated with `username` and push the
/// new snapshot to the device if it is connected.
///
/// The load, mutation and save happen under the store lock, so concurrent
/// updates serialize. The push happens only after a successful save and its
/// outcome never affects the result.
pub async fn update_device_message(
    state: &AppState,
    username: &str,
    message: &str,
) -> Result<UpdatedDevice, ApiError> {
    if username.is_empty() || message.is_empty() {
        return Err(ApiError::Validation(
            "Missing data: username and/or message".to_string(),
        ));
    }

    let store = state.store.clone();
    let username_owned = username.to_string();
    let message_owned = message.to_string();

    let snapshot = tokio::task::spawn_blocking(move || -> Result<DeviceSnapshot, ApiError> {
        let guard = store.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut doc = guard.load()?;

        let user = doc
            .find_user(&username_owned)
            .cloned()
            .ok_or(ApiError::NotFound(Resource::User))?;
        let device = doc
            .device_for_user_mut(&user)
            .ok_or(ApiError::NotFound(Resource::Device))?;

        device.last_message = message_owned;
        let snapshot = device.snapshot();

        guard.save(&doc)?;
        Ok(snapshot)
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))??;

    match state.connections.send(&snapshot.mac_address, &snapshot) {
        DeliveryOutcome::Delivered => {
            tracing::info!(
                username = %username,
                mac_address = %snapshot.mac_address,
                "Pushed updated state to device"
            );
        }
        DeliveryOutcome::NotConnected => {
            tracing::info!(
                username = %username,
                mac_address = %snapshot.mac_address,
                "Device not connected, state saved only"
            );
        }
    }

    Ok(UpdatedDevice {
        mac_address: snapshot.mac_address,
        last_message: snapshot.last_message,
    })
}

/// POST /device/update: set the last message of the caller's device.
pub async fn update_device(
    State(state): State<AppState>,
    payload: Result<Json<UpdateDeviceRequest>, JsonRejection>,
) -> Result<Json<UpdateDeviceResponse>, ApiError> {
    let Json(req) = payload.map_err(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "Rejected update body");
        ApiError::Validation("Missing data: username and/or message".to_string())
    })?;

    let device = update_device_message(
        &state,
        req.username.as_deref().unwrap_or_default(),
        req.message.as_deref().unwrap_or_default(),
    )
    .await?;

    Ok(Json(UpdateDeviceResponse {
        message: "Device message updated".to_string(),
        device,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::StateDocument;
    use crate::store::{StateStore, StorePool};
    use crate::ws::{ConnectionRegistry, Liveness};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory store that counts loads and can refuse writes.
    struct TestStore {
        doc: Mutex<StateDocument>,
        loads: Arc<AtomicUsize>,
        fail_saves: bool,
    }

    impl StateStore for TestStore {
        fn load(&self) -> Result<StateDocument, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.doc.lock().unwrap().clone())
        }

        fn save(&self, doc: &StateDocument) -> Result<(), StoreError> {
            if self.fail_saves {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            *self.doc.lock().unwrap() = doc.clone();
            Ok(())
        }
    }

    fn seed() -> StateDocument {
        serde_json::from_value(serde_json::json!({
            "users": [{"username": "alice", "associatedUser": "dev1"},
                      {"username": "carol", "associatedUser": "nobody"}],
            "devices": [{"macAddress": "AA:BB", "userAssociated": "dev1",
                         "lastMessage": "", "r": 0, "g": 0, "b": 0, "sound": 0}]
        }))
        .unwrap()
    }

    fn test_state(fail_saves: bool) -> (AppState, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let store: StorePool = Arc::new(Mutex::new(TestStore {
            doc: Mutex::new(seed()),
            loads: loads.clone(),
            fail_saves,
        }));
        let state = AppState {
            store,
            connections: ConnectionRegistry::new(),
            liveness: Liveness::default(),
        };
        (state, loads)
    }

    fn stored_message(state: &AppState) -> String {
        let doc = state.store.lock().unwrap().load().unwrap();
        doc.find_device("AA:BB").unwrap().last_message.clone()
    }

    #[tokio::test]
    async fn test_update_sets_last_message() {
        let (state, _) = test_state(false);

        let updated = update_device_message(&state, "alice", "on").await.unwrap();

        assert_eq!(
            updated,
            UpdatedDevice {
                mac_address: "AA:BB".to_string(),
                last_message: "on".to_string(),
            }
        );
        assert_eq!(stored_message(&state), "on");
    }

    #[tokio::test]
    async fn test_missing_input_never_touches_store() {
        let (state, loads) = test_state(false);

        let err = update_device_message(&state, "", "on").await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        let err = update_device_message(&state, "alice", "").await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_and_unassociated_device() {
        let (state, _) = test_state(false);

        let err = update_device_message(&state, "mallory", "on").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(Resource::User)));

        let err = update_device_message(&state, "carol", "on").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(Resource::Device)));
        assert_eq!(stored_message(&state), "");
    }

    #[tokio::test]
    async fn test_failed_save_reports_storage_error_and_pushes_nothing() {
        let (state, _) = test_state(true);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        state.connections.register("AA:BB", tx);

        let err = update_device_message(&state, "alice", "on").await.unwrap_err();

        assert!(matches!(err, ApiError::Storage(_)));
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(stored_message(&state), "");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connected_device_receives_push() {
        let (state, _) = test_state(false);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        state.connections.register("AA:BB", tx);

        update_device_message(&state, "alice", "blink").await.unwrap();

        match rx.try_recv().unwrap() {
            axum::extract::ws::Message::Text(text) => {
                let pushed: DeviceSnapshot = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(pushed.mac_address, "AA:BB");
                assert_eq!(pushed.last_message, "blink");
            }
            other => panic!("Expected text frame, got {:?}", other),
        }
    }
}
