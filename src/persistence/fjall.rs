//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! All clients share one partition; each client's keys are prefixed with
//! the length of its identifier and the identifier itself, so no client's
//! prefix is the start of another's.

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::Store;
use super::error::Result;

/// Fjall keyspace holding the ledger records of every client
#[derive(Clone)]
pub struct FjallBackend {
    keyspace: Keyspace,
    inflight: PartitionHandle,
}

impl FjallBackend {
    /// Open a fjall backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let inflight = keyspace.open_partition("inflight", PartitionCreateOptions::default())?;

        Ok(Self { keyspace, inflight })
    }

    /// Store view scoped to one client identifier
    pub fn store_for(&self, client_id: &str) -> FjallStore {
        FjallStore {
            keyspace: self.keyspace.clone(),
            partition: self.inflight.clone(),
            prefix: scope_prefix(client_id),
        }
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

fn scope_prefix(client_id: &str) -> String {
    format!("{}:{}/", client_id.len(), client_id)
}

/// One client's slice of a [`FjallBackend`]
pub struct FjallStore {
    keyspace: Keyspace,
    partition: PartitionHandle,
    prefix: String,
}

impl FjallStore {
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl Store for FjallStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.partition.insert(self.full_key(key), value)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.partition.get(self.full_key(key))?.map(|v| v.to_vec()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.partition.remove(self.full_key(key))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut result = Vec::new();
        for item in self.partition.prefix(&self.prefix) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(stripped) = key.strip_prefix(&self.prefix) {
                result.push(stripped.to_string());
            }
        }
        Ok(result)
    }

    fn clear(&self) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for item in self.partition.prefix(&self.prefix) {
            let (key, _) = item?;
            batch.remove(&self.partition, key);
        }
        batch.commit()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
