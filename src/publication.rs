//! Publication Store
//!
//! Topic and payload blobs shared by every in-flight record that still needs
//! them. Each [`PublicationRef`] accounts for exactly one unit of the
//! ownership count: cloning retains, [`PublicationRef::release`] (or dropping
//! the handle) releases. The blob is freed when the count reaches zero and is
//! unreachable afterwards, even through a [`PublicationWatch`].
//!
//! Counts are per publication, so concurrent retain/release on unrelated
//! publications never contend on a store-wide lock.

use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use fnv::FnvHasher;
use parking_lot::RwLock;
use tracing::trace;

/// Content fingerprint used to spot redelivered duplicates during recovery
pub fn fingerprint(topic: &str, payload: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(topic.as_bytes());
    hasher.write_u8(0);
    hasher.write(payload);
    hasher.finish()
}

struct PublicationData {
    topic: Arc<str>,
    payload: Bytes,
}

struct Shared {
    count: AtomicUsize,
    fingerprint: u64,
    data: RwLock<Option<PublicationData>>,
    live: Arc<AtomicUsize>,
}

impl Shared {
    /// Increment unless the publication has already been freed
    fn try_retain(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrement; frees the blob and returns true when this was the last owner
    fn release(&self) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "publication released more times than retained");
        if previous == 1 {
            self.data.write().take();
            self.live.fetch_sub(1, Ordering::AcqRel);
            trace!("Publication {:016x} freed", self.fingerprint);
            true
        } else {
            false
        }
    }

    fn matches(&self, topic: &str, payload: &[u8]) -> bool {
        match self.data.read().as_ref() {
            Some(data) => &*data.topic == topic && data.payload == payload,
            None => false,
        }
    }
}

/// Owning handle on a shared publication
pub struct PublicationRef {
    inner: Option<Arc<Shared>>,
}

impl PublicationRef {
    fn shared(&self) -> &Arc<Shared> {
        // `inner` is only taken by `release`, which consumes the handle
        self.inner
            .as_ref()
            .unwrap_or_else(|| unreachable!("publication handle used after release"))
    }

    /// Take another share of the same publication
    pub fn retain(&self) -> PublicationRef {
        let shared = self.shared();
        shared.count.fetch_add(1, Ordering::AcqRel);
        PublicationRef {
            inner: Some(shared.clone()),
        }
    }

    /// Give up this share. Returns true if it was the last one and the
    /// topic and payload have been freed.
    pub fn release(mut self) -> bool {
        match self.inner.take() {
            Some(shared) => shared.release(),
            None => false,
        }
    }

    pub fn topic(&self) -> Arc<str> {
        self.shared()
            .data
            .read()
            .as_ref()
            .map(|d| d.topic.clone())
            .unwrap_or_else(|| Arc::from(""))
    }

    pub fn payload(&self) -> Bytes {
        self.shared()
            .data
            .read()
            .as_ref()
            .map(|d| d.payload.clone())
            .unwrap_or_default()
    }

    pub fn fingerprint(&self) -> u64 {
        self.shared().fingerprint
    }

    /// Current number of owners
    pub fn ref_count(&self) -> usize {
        self.shared().count.load(Ordering::Acquire)
    }

    /// Topic plus payload length in bytes
    pub fn len(&self) -> usize {
        self.shared()
            .data
            .read()
            .as_ref()
            .map(|d| d.topic.len() + d.payload.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles share one publication
    pub fn ptr_eq(&self, other: &PublicationRef) -> bool {
        Arc::ptr_eq(self.shared(), other.shared())
    }

    /// Non-owning observer, used to check that a blob has been freed
    pub fn watch(&self) -> PublicationWatch {
        PublicationWatch {
            inner: Arc::downgrade(self.shared()),
        }
    }
}

impl Clone for PublicationRef {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl Drop for PublicationRef {
    fn drop(&mut self) {
        if let Some(shared) = self.inner.take() {
            shared.release();
        }
    }
}

impl fmt::Debug for PublicationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(shared) => f
                .debug_struct("PublicationRef")
                .field("fingerprint", &format_args!("{:016x}", shared.fingerprint))
                .field("count", &shared.count.load(Ordering::Relaxed))
                .finish(),
            None => f.write_str("PublicationRef(released)"),
        }
    }
}

/// Observer that never keeps a publication alive
#[derive(Clone)]
pub struct PublicationWatch {
    inner: Weak<Shared>,
}

impl PublicationWatch {
    pub fn is_freed(&self) -> bool {
        match self.inner.upgrade() {
            Some(shared) => shared.data.read().is_none(),
            None => true,
        }
    }

    /// Payload, or `None` once the publication has been freed
    pub fn payload(&self) -> Option<Bytes> {
        let shared = self.inner.upgrade()?;
        let data = shared.data.read();
        data.as_ref().map(|d| d.payload.clone())
    }

    pub fn ref_count(&self) -> usize {
        self.inner
            .upgrade()
            .map(|s| s.count.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Factory for publications, shared by all sessions of a registry
pub struct PublicationStore {
    live: Arc<AtomicUsize>,
    /// Fingerprint index consulted only while sessions are being restored
    recovery_index: DashMap<u64, Weak<Shared>>,
}

impl PublicationStore {
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            recovery_index: DashMap::new(),
        }
    }

    fn create(&self, topic: Arc<str>, payload: Bytes, fingerprint: u64) -> Arc<Shared> {
        self.live.fetch_add(1, Ordering::AcqRel);
        Arc::new(Shared {
            count: AtomicUsize::new(1),
            fingerprint,
            data: RwLock::new(Some(PublicationData { topic, payload })),
            live: self.live.clone(),
        })
    }

    /// Wrap a new topic/payload pair with an ownership count of one
    pub fn acquire(&self, topic: impl Into<Arc<str>>, payload: impl Into<Bytes>) -> PublicationRef {
        let topic = topic.into();
        let payload = payload.into();
        let fp = fingerprint(&topic, &payload);
        PublicationRef {
            inner: Some(self.create(topic, payload, fp)),
        }
    }

    /// Like [`acquire`](Self::acquire), but while restoring persisted state a
    /// publication with identical content is shared instead of duplicated.
    pub fn acquire_recovered(
        &self,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Bytes>,
    ) -> PublicationRef {
        let topic = topic.into();
        let payload = payload.into();
        let fp = fingerprint(&topic, &payload);

        if let Some(existing) = self.recovery_index.get(&fp).and_then(|w| w.upgrade()) {
            if existing.matches(&topic, &payload) && existing.try_retain() {
                trace!("Recovered publication {:016x} shared", fp);
                return PublicationRef {
                    inner: Some(existing),
                };
            }
        }

        let shared = self.create(topic, payload, fp);
        self.recovery_index.insert(fp, Arc::downgrade(&shared));
        PublicationRef {
            inner: Some(shared),
        }
    }

    /// Stop deduplicating; called once every session has been restored
    pub fn finish_recovery(&self) {
        self.recovery_index.clear();
    }

    /// Number of publications not yet freed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl Default for PublicationStore {
    fn default() -> Self {
        Self::new()
    }
}
