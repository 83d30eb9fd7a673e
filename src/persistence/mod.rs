//! Persistence Adapter
//!
//! Makes ledger mutations durable through a client-scoped key/value
//! [`Store`]. Every record passes the before-write hook on its way in and
//! the after-read hook on its way out, so hooks can encrypt, sign or audit.
//!
//! Backends:
//! - `MemoryStore` - in-process, for tests and ephemeral sessions
//! - `FjallBackend` - local LSM-tree storage

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{MemoryStore, NoHooks, PersistenceHooks, Store};
pub use error::{PersistenceError, Result};
pub use fjall::{FjallBackend, FjallStore};
pub use models::{
    instant_to_unix_secs, unix_secs_to_instant, StoredMessage, StoredProperties, StoredQueue,
};

use std::fmt;
use std::sync::Arc;

use tracing::trace;

/// Key of an outbound in-flight record
pub fn outbound_key(message_id: u16) -> String {
    format!("s-{}", message_id)
}

/// Key of an inbound in-flight record
pub fn inbound_key(message_id: u16) -> String {
    format!("r-{}", message_id)
}

/// Key of a pending-queue record; zero padded so keys sort by admission
pub fn pending_key(seqno: u64) -> String {
    format!("q-{:020}", seqno)
}

/// Durability policy and hooks for one session
#[derive(Clone)]
pub struct Persistence {
    store: Option<Arc<dyn Store>>,
    hooks: Arc<dyn PersistenceHooks>,
    mandatory: bool,
}

impl Persistence {
    /// No durability: every operation succeeds without storing anything
    pub fn disabled() -> Self {
        Self {
            store: None,
            hooks: Arc::new(NoHooks),
            mandatory: false,
        }
    }

    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store: Some(store),
            hooks: Arc::new(NoHooks),
            mandatory: false,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PersistenceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// A mandatory store failure also takes the session's connection down
    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// Serialize a value using bincode
    fn serialize(record: &StoredMessage) -> Result<Vec<u8>> {
        bincode::encode_to_vec(record, bincode::config::standard()).map_err(PersistenceError::from)
    }

    fn deserialize(key: &str, bytes: &[u8]) -> Result<StoredMessage> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(|source| PersistenceError::Decode {
                key: key.to_string(),
                source,
            })
    }

    /// Store a record, returning the number of bytes written
    pub fn write(&self, key: &str, record: &StoredMessage) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let bytes = self.hooks.before_write(key, Self::serialize(record)?)?;
        store.put(key, &bytes)?;
        trace!("Persisted {} ({} bytes)", key, bytes.len());
        Ok(bytes.len())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        if let Some(store) = &self.store {
            store.remove(key)?;
            trace!("Removed {}", key);
        }
        Ok(())
    }

    /// Read every record. Individual records that fail the after-read hook
    /// or do not decode are returned as errors so the caller can drop them.
    pub fn restore(&self) -> Result<Vec<(String, Result<StoredMessage>)>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for key in store.keys()? {
            let Some(bytes) = store.get(&key)? else {
                continue;
            };
            let decoded = self
                .hooks
                .after_read(&key, bytes)
                .and_then(|bytes| Self::deserialize(&key, &bytes));
            records.push((key, decoded));
        }
        Ok(records)
    }

    /// Remove every record of the session
    pub fn clear(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.clear(),
            None => Ok(()),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.flush(),
            None => Ok(()),
        }
    }
}

impl Default for Persistence {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("enabled", &self.is_enabled())
            .field("mandatory", &self.mandatory)
            .finish()
    }
}
