//! Session Registry
//!
//! Indexes sessions by client identifier and by the transport currently
//! attached to them. One registry is created per process and passed to the
//! application, network and driver actors. Lookups never hold a map guard
//! while a session lock is taken, so work on different sessions proceeds
//! independently.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::connection::ConnectState;
use crate::ledger::PublishRequest;
use crate::persistence::Persistence;
use crate::protocol::Inbound;
use crate::publication::PublicationStore;
use crate::session::{Session, SessionError, SessionEvent, SessionHandle, SessionOptions};
use crate::transport::{Transport, TransportId};

/// Session event tagged with the owning client
pub type ClientEvent = (Arc<str>, SessionEvent);

pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, SessionHandle>,
    transports: DashMap<TransportId, Arc<str>>,
    publications: Arc<PublicationStore>,
    /// Events of sessions that left the registry before they were drained
    retired: Mutex<Vec<ClientEvent>>,
    /// Serializes evict, restore and insert of `register`
    registering: Mutex<()>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_publications(Arc::new(PublicationStore::new()))
    }

    pub fn with_publications(publications: Arc<PublicationStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            transports: DashMap::new(),
            publications,
            retired: Mutex::new(Vec::new()),
            registering: Mutex::new(()),
        }
    }

    pub fn publications(&self) -> &Arc<PublicationStore> {
        &self.publications
    }

    /// Create, restore and register a session.
    ///
    /// A session already registered under the same identifier is moved to
    /// DISCONNECTING and removed before the new one is restored, so both
    /// never touch the same persisted records at once.
    pub fn register(
        &self,
        client_id: &str,
        options: SessionOptions,
        persistence: Persistence,
        now: Instant,
    ) -> Result<SessionHandle, SessionError> {
        let _registering = self.registering.lock();
        if let Some(previous) = self.evict(client_id, now) {
            info!(
                "Client {} registered again, previous session {:?} disconnected",
                client_id,
                previous.lock().state()
            );
        }

        let mut session = Session::new(
            client_id,
            options,
            persistence,
            self.publications.clone(),
            now,
        );
        session.restore(now)?;

        let client_id = session.client_id().clone();
        let handle = session.into_handle();
        if let Some(displaced) = self.sessions.insert(client_id.clone(), handle.clone()) {
            warn!("Client {} replaced a session registered concurrently", client_id);
            self.close(&client_id, &displaced, now);
        }
        debug!("Client {} registered ({} sessions)", client_id, self.len());
        Ok(handle)
    }

    /// Disconnect and unregister a session, keeping its final events
    pub fn remove(&self, client_id: &str, now: Instant) -> Option<SessionHandle> {
        let handle = self.evict(client_id, now)?;
        debug!("Client {} removed", client_id);
        Some(handle)
    }

    fn evict(&self, client_id: &str, now: Instant) -> Option<SessionHandle> {
        let (id, handle) = self.sessions.remove(client_id)?;
        self.close(&id, &handle, now);
        Some(handle)
    }

    /// Disconnect a session that is no longer registered
    fn close(&self, client_id: &Arc<str>, handle: &SessionHandle, now: Instant) {
        let mut session = handle.lock();
        let transport = session.transport_id();
        if let Err(e) = session.disconnect(now) {
            warn!("Client {} disconnect failed: {}", client_id, e);
        }
        if let Some(transport) = transport {
            self.transports.remove_if(&transport, |_, owner| owner == client_id);
        }
        self.retire(client_id, session.take_events());
    }

    fn retire(&self, client_id: &Arc<str>, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        self.retired
            .lock()
            .extend(events.into_iter().map(|e| (client_id.clone(), e)));
    }

    pub fn get(&self, client_id: &str) -> Option<SessionHandle> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Session owning transport `id`, if it is still attached
    pub fn by_transport(&self, id: TransportId) -> Option<SessionHandle> {
        let client_id = self.transports.get(&id).map(|r| r.clone())?;
        self.get(&client_id)
    }

    fn require(&self, client_id: &str) -> Result<SessionHandle, SessionError> {
        self.get(client_id)
            .ok_or_else(|| SessionError::UnknownClient(client_id.to_string()))
    }

    /// Keep the transport index in step with a session's attachment
    fn reindex(&self, client_id: &Arc<str>, before: Option<TransportId>, after: Option<TransportId>) {
        if before == after {
            return;
        }
        if let Some(old) = before {
            self.transports.remove_if(&old, |_, owner| owner == client_id);
        }
        if let Some(new) = after {
            self.transports.insert(new, client_id.clone());
        }
    }

    /// Run `f` against the session behind `handle` and update the transport
    /// index with whatever attachment change it caused
    fn with_session<T>(
        &self,
        handle: &SessionHandle,
        f: impl FnOnce(&mut Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut session = handle.lock();
        let before = session.transport_id();
        let result = f(&mut session);
        let after = session.transport_id();
        let client_id = session.client_id().clone();
        drop(session);
        self.reindex(&client_id, before, after);
        result
    }

    // ------------------------------------------------------------------
    // Application actor
    // ------------------------------------------------------------------

    /// Start a connection attempt for `client_id` over `transport`
    pub fn attach(
        &self,
        client_id: &str,
        transport: Box<dyn Transport>,
        now: Instant,
    ) -> Result<ConnectState, SessionError> {
        let handle = self.require(client_id)?;
        self.with_session(&handle, |session| session.connect(transport, now))
    }

    pub fn publish(
        &self,
        client_id: &str,
        request: PublishRequest,
        now: Instant,
    ) -> Result<u16, SessionError> {
        let handle = self.require(client_id)?;
        self.with_session(&handle, |session| session.enqueue_publish(request, now))
    }

    pub fn disconnect(&self, client_id: &str, now: Instant) -> Result<(), SessionError> {
        let handle = self.require(client_id)?;
        self.with_session(&handle, |session| session.disconnect(now))
    }

    // ------------------------------------------------------------------
    // Network actor
    // ------------------------------------------------------------------

    /// Route an inbound packet to the session owning transport `from`.
    /// Packets from transports no longer attached to any session are dropped.
    pub fn dispatch(&self, from: TransportId, packet: Inbound, now: Instant) -> Result<(), SessionError> {
        let Some(handle) = self.by_transport(from) else {
            trace!("Dropping {:?} from detached transport {}", packet.packet_type(), from);
            return Ok(());
        };
        self.with_session(&handle, |session| session.handle_inbound(from, packet, now))
    }

    /// Transport `from` finished a pending establishment stage
    pub fn drive(&self, from: TransportId, now: Instant) -> Result<Option<ConnectState>, SessionError> {
        let Some(handle) = self.by_transport(from) else {
            return Ok(None);
        };
        self.with_session(&handle, |session| session.drive_connect(now).map(Some))
    }

    /// Transport `from` can accept writes again
    pub fn writable(&self, from: TransportId, now: Instant) -> Result<(), SessionError> {
        let Some(handle) = self.by_transport(from) else {
            return Ok(());
        };
        self.with_session(&handle, |session| session.on_writable(now))
    }

    // ------------------------------------------------------------------
    // Driver actor
    // ------------------------------------------------------------------

    fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }

    /// Tick every session; returns how many reported an error
    pub fn tick_all(&self, now: Instant) -> usize {
        let mut failures = 0;
        for handle in self.handles() {
            if let Err(e) = self.with_session(&handle, |session| session.tick(now)) {
                debug!("Session tick failed: {}", e);
                failures += 1;
            }
        }
        failures
    }

    /// Events from every session, retired sessions first
    pub fn drain_events(&self) -> Vec<ClientEvent> {
        let mut events = std::mem::take(&mut *self.retired.lock());
        for handle in self.handles() {
            let mut session = handle.lock();
            let client_id = session.client_id().clone();
            events.extend(session.take_events().into_iter().map(|e| (client_id.clone(), e)));
        }
        events
    }

    /// Every session has been registered and restored
    pub fn finish_recovery(&self) {
        self.publications.finish_recovery();
        info!(
            "Recovery finished: {} sessions, {} live publications",
            self.len(),
            self.publications.live()
        );
    }

    pub fn client_ids(&self) -> Vec<Arc<str>> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Disconnect every session; sessions stay registered
    pub fn shutdown(&self, now: Instant) {
        for handle in self.handles() {
            if let Err(e) = self.with_session(&handle, |session| session.disconnect(now)) {
                warn!("Disconnect during shutdown failed: {}", e);
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::protocol::{Ack, ConnAck, PacketType, QoS};
    use crate::testing::MockTransport;
    use pretty_assertions::assert_eq;

    fn connect(registry: &SessionRegistry, client_id: &str, id: u64, now: Instant) -> crate::testing::MockHandle {
        let transport = MockTransport::new(id);
        let handle = transport.handle();
        registry.attach(client_id, Box::new(transport), now).unwrap();
        registry
            .dispatch(TransportId(id), Inbound::ConnAck(ConnAck::accepted(false)), now)
            .unwrap();
        handle
    }

    fn register(registry: &SessionRegistry, client_id: &str, now: Instant) -> SessionHandle {
        registry
            .register(client_id, SessionOptions::default(), Persistence::disabled(), now)
            .unwrap()
    }

    #[test]
    fn test_lookup_by_client_and_transport() {
        let now = Instant::now();
        let registry = SessionRegistry::new();
        register(&registry, "a", now);
        register(&registry, "b", now);
        connect(&registry, "a", 1, now);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("A").is_none());

        let owner = registry.by_transport(TransportId(1)).unwrap();
        assert_eq!(&**owner.lock().client_id(), "a");
        assert!(registry.by_transport(TransportId(2)).is_none());
    }

    #[test]
    fn test_concurrent_duplicates_leave_one_live_session() {
        let now = Instant::now();
        let registry = SessionRegistry::new();
        let barrier = std::sync::Barrier::new(8);

        let handles: Vec<SessionHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        register(&registry, "race", now)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(registry.len(), 1);
        let live = registry.get("race").unwrap();
        let mut disconnecting = 0;
        for handle in &handles {
            if Arc::ptr_eq(handle, &live) {
                assert_ne!(handle.lock().state(), ConnectState::Disconnecting);
            } else {
                assert_eq!(handle.lock().state(), ConnectState::Disconnecting);
                disconnecting += 1;
            }
        }
        assert_eq!(disconnecting, 7);
    }

    #[test]
    fn test_duplicate_client_disconnects_previous() {
        let now = Instant::now();
        let registry = SessionRegistry::new();
        let first = register(&registry, "dup", now);
        let wire = connect(&registry, "dup", 1, now);
        registry.drain_events();

        let second = register(&registry, "dup", now);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.lock().state(), ConnectState::Disconnecting);
        assert!(!first.lock().is_connected());
        assert!(wire.is_closed());
        assert_eq!(wire.packet_types().last(), Some(&PacketType::Disconnect));
        assert!(registry.by_transport(TransportId(1)).is_none());
        assert_eq!(registry.len(), 1);

        let events = registry.drain_events();
        assert_eq!(events, vec![(Arc::from("dup"), SessionEvent::Disconnected)]);
    }

    #[test]
    fn test_duplicate_client_restores_from_shared_store() {
        let now = Instant::now();
        let registry = SessionRegistry::new();
        let store = MemoryStore::new();
        let options = SessionOptions {
            clean_start: false,
            ..Default::default()
        };
        let persistence = || Persistence::new(Arc::new(store.clone()));

        registry
            .register("durable", options.clone(), persistence(), now)
            .unwrap();
        connect(&registry, "durable", 1, now);
        registry
            .publish("durable", PublishRequest::new("t", "x", QoS::AtLeastOnce), now)
            .unwrap();

        let second = registry.register("durable", options, persistence(), now).unwrap();
        assert_eq!(second.lock().ledger().outbound_len(), 1);
    }

    #[test]
    fn test_dispatch_from_stale_transport_dropped() {
        let now = Instant::now();
        let registry = SessionRegistry::new();
        register(&registry, "c", now);
        connect(&registry, "c", 1, now);

        // Reattaching replaces the index entry for the old transport
        let transport = MockTransport::new(2);
        registry.attach("c", Box::new(transport), now).unwrap();
        assert!(registry.by_transport(TransportId(1)).is_none());
        assert!(registry.by_transport(TransportId(2)).is_some());

        registry
            .dispatch(TransportId(1), Inbound::ConnAck(ConnAck::accepted(false)), now)
            .unwrap();
        assert!(!registry.get("c").unwrap().lock().is_connected());
    }

    #[test]
    fn test_protocol_error_scoped_to_one_session() {
        let now = Instant::now();
        let registry = SessionRegistry::new();
        register(&registry, "x", now);
        register(&registry, "y", now);
        connect(&registry, "x", 1, now);
        connect(&registry, "y", 2, now);

        assert!(registry
            .dispatch(TransportId(1), Inbound::PubAck(Ack::new(42)), now)
            .is_err());
        assert!(registry.get("x").unwrap().lock().is_connected());
        assert!(registry.get("y").unwrap().lock().is_connected());

        let violations: Vec<_> = registry
            .drain_events()
            .into_iter()
            .filter(|(_, event)| matches!(event, SessionEvent::ProtocolViolation { .. }))
            .map(|(client_id, _)| client_id)
            .collect();
        assert_eq!(violations, vec![Arc::from("x")]);
    }

    #[test]
    fn test_tick_all_unindexes_dead_transports() {
        let t0 = Instant::now();
        let registry = SessionRegistry::new();
        register(&registry, "k", t0);
        let wire = connect(&registry, "k", 1, t0);

        wire.set_fail_writes(true);
        assert_eq!(registry.tick_all(t0 + std::time::Duration::from_secs(60)), 1);
        assert!(registry.by_transport(TransportId(1)).is_none());
        assert!(matches!(
            registry.drain_events().last(),
            Some((_, SessionEvent::ConnectionLost { .. }))
        ));
    }

    #[test]
    fn test_unknown_client() {
        let registry = SessionRegistry::new();
        let err = registry
            .publish(
                "nobody",
                PublishRequest::new("t", "x", QoS::AtMostOnce),
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownClient(id) if id == "nobody"));
    }

    #[test]
    fn test_remove_and_shutdown() {
        let now = Instant::now();
        let registry = SessionRegistry::new();
        register(&registry, "r", now);
        register(&registry, "s", now);
        let wire = connect(&registry, "s", 1, now);

        assert!(registry.remove("r", now).is_some());
        assert!(registry.remove("r", now).is_none());
        assert_eq!(registry.client_ids(), vec![Arc::<str>::from("s")]);

        registry.shutdown(now);
        assert!(wire.is_closed());
        assert_eq!(
            registry.get("s").unwrap().lock().state(),
            ConnectState::Disconnecting
        );
    }
}
