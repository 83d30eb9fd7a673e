//! Key/value store and hook traits behind the persistence adapter.
//!
//! A [`Store`] is scoped to one client: keys are the ledger's record keys
//! (`s-12`, `r-7`, `q-00000000000000000042`). Implementations must be safe
//! to call from whichever actor currently owns the session.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::Result;

/// Durable byte store for one client's ledger records
pub trait Store: Send + Sync {
    /// Insert or replace a record
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a record; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// All keys, in byte order
    fn keys(&self) -> Result<Vec<String>>;

    /// Remove every record
    fn clear(&self) -> Result<()>;

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Make previous writes durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Transformations applied around every durable write and read.
///
/// Any context the hooks need (keys, counters) lives in the implementing
/// type. Returning an error aborts the ledger operation that triggered it.
pub trait PersistenceHooks: Send + Sync {
    /// Called with the encoded record before it is stored
    fn before_write(&self, _key: &str, record: Vec<u8>) -> Result<Vec<u8>> {
        Ok(record)
    }

    /// Called with the stored bytes before they are decoded
    fn after_read(&self, _key: &str, record: Vec<u8>) -> Result<Vec<u8>> {
        Ok(record)
    }
}

/// Pass-through hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl PersistenceHooks for NoHooks {}

/// In-process store. Clones share the same map, so a test can drop a
/// session and restore a new one from the surviving clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Store for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.records.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.records.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.lock().keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }
}
