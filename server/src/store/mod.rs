//! Durable device/user state.
//!
//! The store is a single JSON document on disk. It is shared behind one
//! `std::sync::Mutex`; callers lock it inside `spawn_blocking` and hold the lock
//! for a whole read-modify-write so concurrent updates never lose writes.

pub mod models;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use models::{DeviceSnapshot, StateDocument};

/// Errors raised by a [`StateStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("state file is not a valid document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("state store lock poisoned")]
    LockPoisoned,

    #[error("blocking store task failed: {0}")]
    Task(String),
}

/// Read/write access to the persisted document.
pub trait StateStore: Send {
    fn load(&self) -> Result<StateDocument, StoreError>;
    fn save(&self, doc: &StateDocument) -> Result<(), StoreError>;
}

/// Shared handle to the store. Locking it serializes every store access.
pub type StorePool = Arc<Mutex<dyn StateStore>>;

/// Store backed by a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<StateDocument, StoreError> {
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes to a sibling temp file, then renames over the target so a crash
    /// mid-write never leaves a truncated document behind.
    fn save(&self, doc: &StateDocument) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(doc)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Open the JSON store at `data_file`, creating the parent directory and an
/// empty document if the file does not exist yet. An existing file is loaded
/// once so a corrupt document fails startup instead of the first request.
pub fn init_store(data_file: &str) -> Result<StorePool, StoreError> {
    let store = JsonFileStore::new(data_file);

    if let Some(parent) = store.path().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    if store.path().exists() {
        let doc = store.load()?;
        tracing::info!(
            users = doc.users.len(),
            devices = doc.devices.len(),
            "State store loaded from {}",
            store.path().display()
        );
    } else {
        store.save(&StateDocument::default())?;
        tracing::info!("Created empty state store at {}", store.path().display());
    }

    let pool: StorePool = Arc::new(Mutex::new(store));
    Ok(pool)
}

/// Look up the current snapshot for `mac_address`.
/// Returns `Ok(None)` when no device with that identity is stored.
pub async fn fetch_snapshot(
    store: &StorePool,
    mac_address: &str,
) -> Result<Option<DeviceSnapshot>, StoreError> {
    let store = store.clone();
    let mac = mac_address.to_string();

    tokio::task::spawn_blocking(move || -> Result<Option<DeviceSnapshot>, StoreError> {
        let guard = store.lock().map_err(|_| StoreError::LockPoisoned)?;
        let doc = guard.load()?;
        Ok(doc.find_device(&mac).map(|d| d.snapshot()))
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
}
