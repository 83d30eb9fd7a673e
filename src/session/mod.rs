//! MQTT Client Session
//!
//! The aggregate root tying one client identity to its connection state
//! machine, keepalive scheduler, network handle and message ledger. A
//! session is mutated by one actor at a time through a [`SessionHandle`];
//! every entry point takes `now` so the application, network and driver
//! actors all share the same sans-I/O core.

mod error;
mod event;


pub use error::SessionError;
pub use event::{DeliveryFailure, SessionEvent};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectPlan, ConnectState, ConnectionMachine, Drive};
use crate::keepalive::{KeepAlive, KeepAliveAction};
use crate::ledger::{
    AckOutcome, Admitted, InboundOutcome, Ledger, LedgerError, LedgerLimits, Message,
    PublishRequest, ReceivedMessage,
};
use crate::persistence::Persistence;
use crate::protocol::{
    Ack, ConnAck, ConnectRequest, Inbound, Outbound, ProtocolError, ProtocolVersion,
    WillMessage, REASON_PACKET_ID_NOT_FOUND,
};
use crate::publication::PublicationStore;
use crate::transport::{NetworkHandle, Transport, TransportId, WriteStatus};

/// Session guarded by its own lock; sessions never share one
pub type SessionHandle = Arc<Mutex<Session>>;

/// Per-client settings fixed at creation
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub protocol_version: ProtocolVersion,
    /// Seconds, 0 disables keepalive
    pub keep_alive: u16,
    pub retry_interval: Duration,
    pub max_inflight: usize,
    /// 0 means unbounded
    pub max_pending: usize,
    /// clean_session for MQTT 3.x, clean_start for MQTT 5
    pub clean_start: bool,
    /// MQTT 5 only
    pub session_expiry_interval: u32,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<WillMessage>,
    pub plan: ConnectPlan,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V311,
            keep_alive: 60,
            retry_interval: Duration::from_secs(20),
            max_inflight: 10,
            max_pending: 0,
            clean_start: true,
            session_expiry_interval: 0,
            username: None,
            password: None,
            will: None,
            plan: ConnectPlan::default(),
        }
    }
}

impl SessionOptions {
    /// Whether in-flight state outlives the connection
    pub fn retains_state(&self) -> bool {
        if self.protocol_version.is_v5() {
            self.session_expiry_interval > 0
        } else {
            !self.clean_start
        }
    }

    fn limits(&self) -> LedgerLimits {
        LedgerLimits {
            max_inflight: self.max_inflight.max(1),
            max_pending: self.max_pending,
            retry_interval: self.retry_interval,
        }
    }
}

/// Session Record
pub struct Session {
    client_id: Arc<str>,
    options: SessionOptions,
    connected: bool,
    /// False once a transport error occurred, until the next connect
    good: bool,
    machine: ConnectionMachine,
    keepalive: KeepAlive,
    net: NetworkHandle,
    ledger: Ledger,
    publications: Arc<PublicationStore>,
    /// CONNECT could not be written yet
    connect_unsent: bool,
    /// Outbound entries to resend after the last CONNACK
    connect_count: usize,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(
        client_id: impl Into<Arc<str>>,
        options: SessionOptions,
        persistence: Persistence,
        publications: Arc<PublicationStore>,
        now: Instant,
    ) -> Self {
        let client_id = client_id.into();
        let mut ledger = Ledger::new(client_id.clone(), options.limits(), persistence);
        ledger.set_durable(options.retains_state());

        Self {
            machine: ConnectionMachine::new(options.plan.clone()),
            keepalive: KeepAlive::new(Duration::from_secs(options.keep_alive as u64)),
            net: NetworkHandle::new(now),
            ledger,
            publications,
            client_id,
            options,
            connected: false,
            good: true,
            connect_unsent: false,
            connect_count: 0,
            events: Vec::new(),
        }
    }

    pub fn into_handle(self) -> SessionHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectState {
        self.machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_good(&self) -> bool {
        self.good
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn keepalive(&self) -> &KeepAlive {
        &self.keepalive
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.net
    }

    pub fn transport_id(&self) -> Option<TransportId> {
        self.net.id()
    }

    pub fn will(&self) -> Option<&WillMessage> {
        self.options.will.as_ref()
    }

    /// (entries to resend after CONNACK, entries already resent)
    pub fn connect_progress(&self) -> (usize, usize) {
        let outstanding = self.ledger.replay_outstanding();
        (
            self.connect_count,
            self.connect_count.saturating_sub(outstanding),
        )
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_received(&mut self) -> Vec<ReceivedMessage> {
        self.ledger.take_received()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Load persisted ledger records. Records that fail the after-read hook,
    /// do not decode or duplicate an admitted entry are deleted. A session
    /// that already holds messages restores nothing.
    pub fn restore(&mut self, now: Instant) -> Result<usize, SessionError> {
        let persistence = self.ledger.persistence().clone();
        let mut records = Vec::new();
        for (key, record) in persistence.restore()? {
            match record {
                Ok(record) => records.push((key, record)),
                Err(e) => {
                    warn!(
                        "Client {} dropping unreadable record {}: {}",
                        self.client_id, key, e
                    );
                    persistence.remove(&key)?;
                }
            }
        }
        let restored = self.ledger.restore(records, &self.publications, now)?;
        if restored > 0 {
            info!(
                "Client {} restored {} persisted messages",
                self.client_id, restored
            );
        }
        Ok(restored)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Start a connection attempt over `transport`
    pub fn connect(
        &mut self,
        transport: Box<dyn Transport>,
        now: Instant,
    ) -> Result<ConnectState, SessionError> {
        self.machine.begin()?;

        if self.options.clean_start {
            match self.ledger.discard() {
                Ok(dropped) => self.report_discarded(dropped),
                Err(e) => {
                    let err = self.ledger_error(e);
                    self.machine.fail();
                    return Err(err);
                }
            }
        }

        debug!(
            "Client {} connecting over transport {}",
            self.client_id,
            transport.id()
        );
        self.keepalive.reset();
        self.net.attach(transport, now);
        self.connected = false;
        self.good = true;
        self.connect_unsent = false;
        self.connect_count = 0;
        self.drive_connect(now)
    }

    /// Advance transport establishment; called again whenever the transport
    /// reports progress on a pending stage.
    pub fn drive_connect(&mut self, now: Instant) -> Result<ConnectState, SessionError> {
        let tls_session = self.net.tls_session.clone();
        let transport = self.net.transport_mut()?;
        match self.machine.drive(transport, tls_session.as_ref()) {
            Drive::Pending | Drive::Idle => {}
            Drive::ReadyForConnect => {
                if let Some(session) = transport.tls_session() {
                    self.net.tls_session = Some(session);
                }
                self.net.websocket_key = self.net.transport_mut()?.websocket_key();
                self.connect_unsent = true;
                self.send_connect(now)?;
            }
            Drive::Failed(e) => {
                self.fail_connection(&e);
                return Err(e.into());
            }
        }
        Ok(self.machine.state())
    }

    fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            protocol_version: self.options.protocol_version,
            client_id: self.client_id.clone(),
            clean_start: self.options.clean_start,
            keep_alive: self.keepalive.saved_interval().as_secs() as u16,
            username: self.options.username.clone(),
            password: self.options.password.clone(),
            will: self.options.will.clone(),
            session_expiry_interval: if self.options.protocol_version.is_v5() {
                self.options.session_expiry_interval
            } else {
                0
            },
        }
    }

    fn send_connect(&mut self, now: Instant) -> Result<(), SessionError> {
        if !self.connect_unsent {
            return Ok(());
        }
        let packet = Outbound::Connect(Box::new(self.connect_request()));
        if self.write(&packet, now)? == WriteStatus::Written {
            trace!("Client {} sent CONNECT", self.client_id);
            self.connect_unsent = false;
        }
        Ok(())
    }

    fn handle_connack(&mut self, connack: ConnAck, now: Instant) -> Result<(), SessionError> {
        if self.machine.state() != ConnectState::WaitForConnAck {
            return Err(self.protocol_violation(ProtocolError::UnexpectedConnAck));
        }
        if !connack.is_success() {
            let error = ProtocolError::ConnectionRefused(connack.code);
            self.fail_connection(&error);
            return Err(error.into());
        }

        self.machine.connack_accepted()?;
        self.connected = true;
        if self.options.protocol_version.is_v5() {
            if let Some(secs) = connack.properties.server_keep_alive {
                debug!("Client {} server keep alive {}s", self.client_id, secs);
                self.keepalive.set_server_interval(secs);
            }
        }

        self.connect_count = self.ledger.mark_replay();
        info!(
            "Client {} connected (session present: {}, resending {})",
            self.client_id, connack.session_present, self.connect_count
        );
        self.events.push(SessionEvent::Connected {
            session_present: connack.session_present,
        });
        self.pump(now)
    }

    /// Transport failure or dead peer: drop the connection, keep the ledger
    pub fn fail_connection(&mut self, reason: &dyn fmt::Display) {
        let was_connected = self.connected;
        self.good = false;
        self.connected = false;
        self.connect_unsent = false;
        self.machine.fail();
        self.keepalive.reset();
        if let Some(id) = self.net.release() {
            debug!("Client {} released transport {}", self.client_id, id);
        }

        let reason = reason.to_string();
        if was_connected {
            warn!("Client {} connection lost: {}", self.client_id, reason);
            self.events.push(SessionEvent::ConnectionLost { reason });
        } else {
            warn!("Client {} connect failed: {}", self.client_id, reason);
            self.events.push(SessionEvent::ConnectFailed { reason });
        }
    }

    /// Application-initiated disconnect. DISCONNECTING is entered before any
    /// transport resource is released and stays until the next connect.
    pub fn disconnect(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.machine.state() == ConnectState::Disconnecting && !self.net.is_attached() {
            return Ok(());
        }
        self.machine.begin_disconnect();

        if self.connected {
            if let Err(e) = self.net.write(&Outbound::Disconnect, now) {
                debug!("Client {} DISCONNECT not sent: {}", self.client_id, e);
            }
        }
        self.connected = false;
        self.connect_unsent = false;
        self.keepalive.reset();
        self.net.release();

        if !self.options.retains_state() {
            let dropped = self.ledger.discard().map_err(|e| self.ledger_error(e))?;
            self.report_discarded(dropped);
        }
        if let Err(e) = self.ledger.persistence().flush() {
            warn!("Client {} flush failed: {}", self.client_id, e);
        }

        info!("Client {} disconnected", self.client_id);
        self.events.push(SessionEvent::Disconnected);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Network actor
    // ------------------------------------------------------------------

    /// Apply a packet decoded from transport `from`
    pub fn handle_inbound(
        &mut self,
        from: TransportId,
        packet: Inbound,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.machine.state() == ConnectState::Disconnecting {
            trace!(
                "Client {} ignoring {:?} while disconnecting",
                self.client_id,
                packet.packet_type()
            );
            return Ok(());
        }
        if self.net.id() != Some(from) {
            trace!(
                "Client {} ignoring {:?} from stale transport {}",
                self.client_id,
                packet.packet_type(),
                from
            );
            return Ok(());
        }
        self.net.last_received = now;

        match packet {
            Inbound::ConnAck(connack) => self.handle_connack(connack, now),
            Inbound::Publish(publish) => {
                let version = self.options.protocol_version;
                let outcome = self
                    .ledger
                    .receive(&self.publications, publish, version, now)
                    .map_err(|e| self.ledger_error(e))?;
                self.finish_inbound(outcome, now)
            }
            Inbound::PubRel(ack) => {
                let outcome = self
                    .ledger
                    .pubrel(ack, self.options.protocol_version)
                    .map_err(|e| self.ledger_error(e))?;
                self.finish_inbound(outcome, now)
            }
            Inbound::PubAck(ack) => {
                let outcome = self.ledger.puback(ack).map_err(|e| self.ledger_error(e))?;
                self.settle(outcome);
                self.pump(now)
            }
            Inbound::PubRec(ack) => match self.ledger.pubrec(ack, now) {
                Ok(outcome) => {
                    self.settle(outcome);
                    self.pump(now)
                }
                Err(LedgerError::Protocol(e @ ProtocolError::UnknownPacketId { .. }))
                    if self.options.protocol_version.is_v5() =>
                {
                    let rel = Ack::with_reason(ack.packet_id, REASON_PACKET_ID_NOT_FOUND);
                    self.write(&Outbound::PubRel(rel), now)?;
                    Err(self.protocol_violation(e))
                }
                Err(e) => Err(self.ledger_error(e)),
            },
            Inbound::PubComp(ack) => {
                let outcome = self.ledger.pubcomp(ack).map_err(|e| self.ledger_error(e))?;
                self.settle(outcome);
                self.pump(now)
            }
            Inbound::PingResp => {
                trace!("Client {} PINGRESP", self.client_id);
                self.keepalive.pong_received();
                Ok(())
            }
            Inbound::Disconnect { reason_code } => {
                self.fail_connection(&format_args!(
                    "server DISCONNECT (reason 0x{:02x})",
                    reason_code
                ));
                Ok(())
            }
        }
    }

    fn finish_inbound(&mut self, outcome: InboundOutcome, now: Instant) -> Result<(), SessionError> {
        if let Some(reply) = outcome.reply {
            // A blocked acknowledgement is repeated when the peer retries
            self.write(&reply, now)?;
        }
        if outcome.delivered {
            if let Some(message) = self.ledger.last_received() {
                let event = SessionEvent::MessageArrived {
                    topic: message.topic(),
                    qos: message.qos,
                };
                self.events.push(event);
            }
        }
        Ok(())
    }

    /// The transport can accept writes again
    pub fn on_writable(&mut self, now: Instant) -> Result<(), SessionError> {
        if !self.net.is_attached() || self.machine.state() == ConnectState::Disconnecting {
            return Ok(());
        }
        self.send_connect(now)?;
        if self.connected && self.keepalive.ping_due() {
            self.send_ping(now)?;
        }
        self.pump(now)
    }

    // ------------------------------------------------------------------
    // Application actor
    // ------------------------------------------------------------------

    /// Accept a publish. It is written as soon as the connection and the
    /// in-flight limit allow; the returned id is 0 for QoS 0.
    pub fn enqueue_publish(
        &mut self,
        request: PublishRequest,
        now: Instant,
    ) -> Result<u16, SessionError> {
        if self.machine.state() == ConnectState::Disconnecting {
            return Err(SessionError::Disconnecting);
        }

        let publication = self
            .publications
            .acquire(request.topic.clone(), request.payload.clone());
        let msgid = self
            .ledger
            .enqueue(
                publication,
                &request,
                self.options.protocol_version,
                now,
            )
            .map_err(|e| self.ledger_error(e))?;

        if let Err(e) = self.pump(now) {
            debug!(
                "Client {} message {} stays queued: {}",
                self.client_id, msgid, e
            );
        }
        Ok(msgid)
    }

    // ------------------------------------------------------------------
    // Driver actor
    // ------------------------------------------------------------------

    /// Periodic work: message expiry, keepalive and retries
    pub fn tick(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.machine.state() == ConnectState::Disconnecting {
            return Ok(());
        }

        let expired = self.ledger.expire(now).map_err(|e| self.ledger_error(e))?;
        for message in expired {
            self.report_failed(message, DeliveryFailure::Expired);
        }

        if !self.connected {
            return Ok(());
        }

        let action = self.keepalive.poll(
            now,
            self.net.last_sent,
            self.net.last_received,
            self.net.last_ping,
        );
        match action {
            KeepAliveAction::Idle => {}
            KeepAliveAction::SendPing => self.send_ping(now)?,
            KeepAliveAction::Dead => {
                self.fail_connection(&ProtocolError::KeepAliveTimeout);
                return Err(ProtocolError::KeepAliveTimeout.into());
            }
        }

        self.ledger.mark_retries(now);
        self.pump(now)
    }

    fn send_ping(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.write(&Outbound::PingReq, now)? {
            WriteStatus::Written => {
                trace!("Client {} sent PINGREQ", self.client_id);
                self.net.last_ping = now;
                self.keepalive.ping_sent();
            }
            WriteStatus::WouldBlock => self.keepalive.ping_blocked(now),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn write(&mut self, packet: &Outbound, now: Instant) -> Result<WriteStatus, SessionError> {
        match self.net.write(packet, now) {
            Ok(status) => Ok(status),
            Err(e) => {
                self.fail_connection(&e);
                Err(e.into())
            }
        }
    }

    /// Write flagged outbound entries in queue order, then admit pending
    /// entries once the reconnect resend sequence is complete.
    fn pump(&mut self, now: Instant) -> Result<(), SessionError> {
        if !self.connected || self.machine.state() == ConnectState::Disconnecting {
            return Ok(());
        }

        loop {
            if let Some(packet) = self.ledger.next_write() {
                let msgid = packet.packet_id().unwrap_or_default();
                match self.write(&packet, now)? {
                    WriteStatus::Written => {
                        self.ledger.confirm_write(msgid, now);
                        continue;
                    }
                    WriteStatus::WouldBlock => return Ok(()),
                }
            }

            if self.ledger.replay_outstanding() > 0 {
                return Ok(());
            }

            match self.ledger.admit(now).map_err(|e| self.ledger_error(e))? {
                Some(Admitted::InFlight(_)) => continue,
                Some(Admitted::AtMostOnce(message)) => {
                    match self.write(&message.outbound_packet(), now)? {
                        WriteStatus::Written => continue,
                        WriteStatus::WouldBlock => {
                            self.ledger.requeue(message);
                            return Ok(());
                        }
                    }
                }
                None => return Ok(()),
            }
        }
    }

    fn settle(&mut self, outcome: AckOutcome) {
        match outcome {
            AckOutcome::Delivered(message) => {
                self.events.push(SessionEvent::Delivered {
                    msgid: message.msgid,
                    topic: message.topic(),
                });
            }
            AckOutcome::Rejected {
                message,
                reason_code,
            } => self.report_failed(message, DeliveryFailure::Rejected(reason_code)),
            AckOutcome::Violation { message, error } => {
                self.report_failed(message, DeliveryFailure::ProtocolViolation(error))
            }
            AckOutcome::Released => {}
        }
    }

    fn report_failed(&mut self, message: Message, reason: DeliveryFailure) {
        debug!(
            "Client {} message {} not delivered: {}",
            self.client_id, message.msgid, reason
        );
        self.events.push(SessionEvent::DeliveryFailed {
            msgid: message.msgid,
            topic: message.topic(),
            reason,
        });
    }

    fn report_discarded(&mut self, dropped: Vec<Message>) {
        for message in dropped {
            self.report_failed(message, DeliveryFailure::Discarded);
        }
    }

    /// Surface a ledger failure; persistence failures are reported as events
    /// and take the connection down when persistence is mandatory.
    fn ledger_error(&mut self, e: LedgerError) -> SessionError {
        match e {
            LedgerError::Persistence(err) => {
                warn!("Client {} persistence failed: {}", self.client_id, err);
                self.events.push(SessionEvent::PersistenceFailed {
                    error: err.to_string(),
                });
                if self.ledger.persistence().is_mandatory() && self.net.is_attached() {
                    self.fail_connection(&format_args!("mandatory persistence failed: {}", err));
                }
                LedgerError::Persistence(err).into()
            }
            LedgerError::Protocol(err) => self.protocol_violation(err),
            e => e.into(),
        }
    }

    /// Report a protocol violation to the application and hand it back as an error
    fn protocol_violation(&mut self, error: ProtocolError) -> SessionError {
        warn!("Client {} protocol violation: {}", self.client_id, error);
        self.events.push(SessionEvent::ProtocolViolation {
            error: error.clone(),
        });
        error.into()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.machine.state())
            .field("connected", &self.connected)
            .field("good", &self.good)
            .field("ledger", &self.ledger)
            .field("net", &self.net)
            .finish()
    }
}
