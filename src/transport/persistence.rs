//! Delivery store for unacknowledged QoS>0 publishes
//!
//! The broker link records every QoS>0 publish here until the broker
//! acknowledges it. Whatever is left over when a link connects again decides
//! whether the session can be resumed (see `TransportConnection::connect`).

use super::Qos;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Which store backs a session; part of the session identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceType {
    File,
    #[default]
    Memory,
}

impl std::fmt::Display for PersistenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceType::File => write!(f, "file"),
            PersistenceType::Memory => write!(f, "memory"),
        }
    }
}

/// A publish handed to the broker and not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDelivery {
    pub message_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to open delivery store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },
    #[error("Delivery store I/O failed: {0}")]
    Storage(#[from] sled::Error),
    #[error("Corrupt delivery record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Storage contract used by broker links
pub trait DeliveryStore: Send + Sync {
    fn put(&self, delivery: PersistedDelivery) -> Result<(), PersistenceError>;
    fn remove(&self, message_id: u16) -> Result<Option<PersistedDelivery>, PersistenceError>;
    /// All unacknowledged deliveries, ordered by message id
    fn pending(&self) -> Result<Vec<PersistedDelivery>, PersistenceError>;
    fn clear(&self) -> Result<(), PersistenceError>;

    fn pending_count(&self) -> usize {
        self.pending().map(|p| p.len()).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeliveryStore {
    deliveries: Mutex<BTreeMap<u16, PersistedDelivery>>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeliveryStore for MemoryDeliveryStore {
    fn put(&self, delivery: PersistedDelivery) -> Result<(), PersistenceError> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(delivery.message_id, delivery);
        Ok(())
    }

    fn remove(&self, message_id: u16) -> Result<Option<PersistedDelivery>, PersistenceError> {
        Ok(self
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message_id))
    }

    fn pending(&self) -> Result<Vec<PersistedDelivery>, PersistenceError> {
        Ok(self
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// sled-backed store that survives a process restart
#[derive(Clone)]
pub struct FileDeliveryStore {
    db: sled::Db,
    path: PathBuf,
}

impl FileDeliveryStore {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let db = sled::open(path).map_err(|source| PersistenceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Store location for one session identity inside `dir`
    pub fn session_path(dir: &Path, client_id: &str, broker_url: &str) -> PathBuf {
        let broker: String = broker_url
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        dir.join(format!("{client_id}-{broker}"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeliveryStore for FileDeliveryStore {
    fn put(&self, delivery: PersistedDelivery) -> Result<(), PersistenceError> {
        let serialized = serde_json::to_vec(&delivery)?;
        self.db
            .insert(delivery.message_id.to_be_bytes(), serialized)?;
        self.db.flush()?;
        Ok(())
    }

    fn remove(&self, message_id: u16) -> Result<Option<PersistedDelivery>, PersistenceError> {
        let removed = self.db.remove(message_id.to_be_bytes())?;
        self.db.flush()?;
        removed
            .map(|raw| serde_json::from_slice(&raw).map_err(PersistenceError::from))
            .transpose()
    }

    fn pending(&self) -> Result<Vec<PersistedDelivery>, PersistenceError> {
        // Big-endian keys keep sled's iteration order equal to id order
        self.db
            .iter()
            .map(|entry| {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileDeliveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDeliveryStore")
            .field("db", &"sled::Db")
            .field("path", &self.path)
            .finish()
    }
}

/// Open the store selected by configuration
pub fn open_store(
    persistence: PersistenceType,
    dir: &Path,
    client_id: &str,
    broker_url: &str,
) -> Result<std::sync::Arc<dyn DeliveryStore>, PersistenceError> {
    match persistence {
        PersistenceType::Memory => Ok(std::sync::Arc::new(MemoryDeliveryStore::new())),
        PersistenceType::File => {
            let path = FileDeliveryStore::session_path(dir, client_id, broker_url);
            Ok(std::sync::Arc::new(FileDeliveryStore::open(&path)?))
        }
    }
}
