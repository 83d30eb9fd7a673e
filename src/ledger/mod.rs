//! Message Ledger
//!
//! Per-session in-flight bookkeeping for QoS 1 and QoS 2 exchanges:
//!
//! - `outbound`: publishes we sent, waiting for PUBACK, PUBREC or PUBCOMP
//! - `inbound`: QoS 2 publishes we received, waiting for PUBREL
//! - `pending`: accepted publishes waiting for an in-flight slot
//! - `received`: completed inbound messages not yet taken by the application
//!
//! The ledger never talks to the transport. Entries that must be written are
//! flagged and handed out by [`Ledger::next_write`]; the session writes them
//! in queue order and confirms each write. Every durable mutation goes
//! through the [`Persistence`] adapter before the in-memory state changes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fnv::FnvHashSet;
use tracing::{debug, trace, warn};

use crate::persistence::{
    self, instant_to_unix_secs, unix_secs_to_instant, Persistence, PersistenceError,
    StoredMessage, StoredQueue,
};
use crate::protocol::{
    Ack, InboundPublish, Outbound, OutboundPublish, PacketType, Properties, ProtocolError,
    ProtocolVersion, QoS, REASON_PACKET_ID_NOT_FOUND,
};
use crate::publication::{PublicationRef, PublicationStore};

#[cfg(test)]
mod tests;

/// Next packet the peer owes us for an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextExpected {
    #[default]
    None,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
}

impl NextExpected {
    pub fn packet_type(self) -> Option<PacketType> {
        match self {
            NextExpected::None => None,
            NextExpected::PubAck => Some(PacketType::PubAck),
            NextExpected::PubRec => Some(PacketType::PubRec),
            NextExpected::PubRel => Some(PacketType::PubRel),
            NextExpected::PubComp => Some(PacketType::PubComp),
        }
    }

    fn code(self) -> u8 {
        self.packet_type().map(|p| p as u8).unwrap_or(0)
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(NextExpected::None),
            4 => Some(NextExpected::PubAck),
            5 => Some(NextExpected::PubRec),
            6 => Some(NextExpected::PubRel),
            7 => Some(NextExpected::PubComp),
            _ => None,
        }
    }

    fn after_publish(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => NextExpected::None,
            QoS::AtLeastOnce => NextExpected::PubAck,
            QoS::ExactlyOnce => NextExpected::PubRec,
        }
    }
}

/// A publish accepted from the application
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl PublishRequest {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            properties: Properties::default(),
        }
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// One in-flight (or pending) protocol exchange
#[derive(Debug)]
pub struct Message {
    pub qos: QoS,
    pub retain: bool,
    pub msgid: u16,
    pub version: ProtocolVersion,
    /// Empty unless the session speaks MQTT 5
    pub properties: Properties,
    pub publication: PublicationRef,
    pub last_touch: Instant,
    pub next_expected: NextExpected,
    /// Bytes of the persisted record, or topic plus payload when not persisted
    pub len: usize,
    pub seqno: u64,
    pub expires_at: Option<Instant>,
    /// Must be (re)written to the transport
    needs_write: bool,
    /// Part of the resend sequence that follows a reconnect
    replay: bool,
    transmissions: u32,
}

impl Message {
    fn publish_packet(&self) -> Outbound {
        let acked = self.qos != QoS::AtMostOnce;
        Outbound::Publish(OutboundPublish {
            packet_id: acked.then_some(self.msgid),
            qos: self.qos,
            retain: self.retain,
            dup: acked && self.transmissions > 0,
            publication: self.publication.clone(),
            properties: self.properties.clone(),
        })
    }

    /// Packet that moves this outbound entry forward from our side
    pub fn outbound_packet(&self) -> Outbound {
        match self.next_expected {
            NextExpected::PubComp => Outbound::PubRel(Ack::new(self.msgid)),
            _ => self.publish_packet(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn topic(&self) -> Arc<str> {
        self.publication.topic()
    }

    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn to_record(&self, queue: StoredQueue) -> StoredMessage {
        StoredMessage {
            queue,
            seqno: self.seqno,
            qos: self.qos as u8,
            retain: self.retain,
            message_id: self.msgid,
            protocol_version: self.version as u8,
            next_expected: self.next_expected.code(),
            topic: self.publication.topic().to_string(),
            payload: self.publication.payload().to_vec(),
            fingerprint: self.publication.fingerprint(),
            properties: (&self.properties).into(),
            expires_at_secs: self.expires_at.map(instant_to_unix_secs),
        }
    }

    fn from_record(record: StoredMessage, publication: PublicationRef, now: Instant) -> Option<Self> {
        let qos = QoS::from_u8(record.qos)?;
        let version = ProtocolVersion::from_u8(record.protocol_version)?;
        let next_expected = NextExpected::from_code(record.next_expected)?;
        let sent_before = record.queue == StoredQueue::Outbound;
        Some(Self {
            qos,
            retain: record.retain,
            msgid: record.message_id,
            version,
            properties: record.properties.into(),
            len: publication.len(),
            publication,
            last_touch: now,
            next_expected,
            seqno: record.seqno,
            expires_at: record.expires_at_secs.map(unix_secs_to_instant),
            needs_write: false,
            replay: false,
            // A restored outbound entry may already have reached the peer
            transmissions: u32::from(sent_before),
        })
    }
}

/// A fully received inbound message waiting for the application
#[derive(Debug)]
pub struct ReceivedMessage {
    pub publication: PublicationRef,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub msgid: Option<u16>,
    pub properties: Properties,
}

impl ReceivedMessage {
    pub fn topic(&self) -> Arc<str> {
        self.publication.topic()
    }

    pub fn payload(&self) -> Bytes {
        self.publication.payload()
    }
}

/// Ledger operation failures
#[derive(Debug)]
pub enum LedgerError {
    Protocol(ProtocolError),
    Persistence(PersistenceError),
    /// Every identifier is held by an incomplete handshake
    NoMessageIdAvailable,
    /// The pending queue is at its configured bound
    QueueFull,
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Protocol(e) => write!(f, "protocol error: {}", e),
            LedgerError::Persistence(e) => write!(f, "persistence error: {}", e),
            LedgerError::NoMessageIdAvailable => write!(f, "no message identifier available"),
            LedgerError::QueueFull => write!(f, "pending queue full"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Protocol(e) => Some(e),
            LedgerError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for LedgerError {
    fn from(e: ProtocolError) -> Self {
        LedgerError::Protocol(e)
    }
}

impl From<PersistenceError> for LedgerError {
    fn from(e: PersistenceError) -> Self {
        LedgerError::Persistence(e)
    }
}

/// Result of applying PUBACK, PUBREC or PUBCOMP to the outbound queue
#[derive(Debug)]
pub enum AckOutcome {
    /// Handshake complete; the entry has been removed
    Delivered(Message),
    /// MQTT 5 failure reason code; the entry has been removed
    Rejected { message: Message, reason_code: u8 },
    /// Acknowledgement for the wrong stage; the entry has been removed
    Violation { message: Message, error: ProtocolError },
    /// PUBREC accepted; a PUBREL is queued and PUBCOMP is awaited
    Released,
}

/// Result of an inbound PUBLISH or PUBREL
#[derive(Debug, Default)]
pub struct InboundOutcome {
    /// A message was added to the received queue
    pub delivered: bool,
    pub reply: Option<Outbound>,
}

/// What [`Ledger::admit`] moved out of the pending queue
#[derive(Debug)]
pub enum Admitted {
    /// QoS > 0 entry now in flight and flagged for writing
    InFlight(u16),
    /// QoS 0 entry; write it once, or [`Ledger::requeue`] it if blocked
    AtMostOnce(Message),
}

/// Limits applied by the ledger
#[derive(Debug, Clone, Copy)]
pub struct LedgerLimits {
    pub max_inflight: usize,
    /// 0 means unbounded
    pub max_pending: usize,
    /// Zero disables timed retry
    pub retry_interval: Duration,
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self {
            max_inflight: 10,
            max_pending: 0,
            retry_interval: Duration::from_secs(20),
        }
    }
}

/// In-flight state of one session
pub struct Ledger {
    client_id: Arc<str>,
    outbound: VecDeque<Message>,
    inbound: VecDeque<Message>,
    pending: VecDeque<Message>,
    received: VecDeque<ReceivedMessage>,
    next_msgid: u16,
    seqno: u64,
    limits: LedgerLimits,
    persistence: Persistence,
    /// Records are written only while the session outlives its connection
    durable: bool,
}

impl Ledger {
    pub fn new(client_id: Arc<str>, limits: LedgerLimits, persistence: Persistence) -> Self {
        Self {
            client_id,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            pending: VecDeque::new(),
            received: VecDeque::new(),
            next_msgid: 1,
            seqno: 0,
            limits,
            persistence,
            durable: false,
        }
    }

    pub fn limits(&self) -> LedgerLimits {
        self.limits
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn is_durable(&self) -> bool {
        self.durable && self.persistence.is_enabled()
    }

    pub fn set_durable(&mut self, durable: bool) {
        self.durable = durable;
    }

    pub fn outbound(&self) -> impl Iterator<Item = &Message> {
        self.outbound.iter()
    }

    pub fn inbound(&self) -> impl Iterator<Item = &Message> {
        self.inbound.iter()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.pending.iter()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn received_len(&self) -> usize {
        self.received.len()
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn last_received(&self) -> Option<&ReceivedMessage> {
        self.received.back()
    }

    pub fn take_received(&mut self) -> Vec<ReceivedMessage> {
        self.received.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn persist(&self, key: &str, message: &Message, queue: StoredQueue) -> Result<usize, LedgerError> {
        if !self.is_durable() {
            return Ok(message.publication.len());
        }
        let written = self.persistence.write(key, &message.to_record(queue))?;
        Ok(written)
    }

    fn unpersist(&self, key: &str) -> Result<(), LedgerError> {
        if self.is_durable() {
            self.persistence.remove(key)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------

    fn msgid_in_use(&self, id: u16) -> bool {
        self.outbound.iter().any(|m| m.msgid == id)
            || self
                .pending
                .iter()
                .any(|m| m.qos != QoS::AtMostOnce && m.msgid == id)
    }

    /// Next free nonzero identifier from the rotating counter
    pub fn allocate_msgid(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_msgid;
            self.next_msgid = if id == u16::MAX { 1 } else { id + 1 };
            if !self.msgid_in_use(id) {
                return Some(id);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Accept a publish into the pending queue
    pub fn enqueue(
        &mut self,
        publication: PublicationRef,
        request: &PublishRequest,
        version: ProtocolVersion,
        now: Instant,
    ) -> Result<u16, LedgerError> {
        if self.limits.max_pending > 0 && self.pending.len() >= self.limits.max_pending {
            return Err(LedgerError::QueueFull);
        }

        let msgid = match request.qos {
            QoS::AtMostOnce => 0,
            _ => self
                .allocate_msgid()
                .ok_or(LedgerError::NoMessageIdAvailable)?,
        };

        let properties = if version.is_v5() {
            request.properties.clone()
        } else {
            Properties::default()
        };
        let expires_at = properties.message_expiry().map(|d| now + d);

        let mut message = Message {
            qos: request.qos,
            retain: request.retain,
            msgid,
            version,
            properties,
            len: publication.len(),
            publication,
            last_touch: now,
            next_expected: NextExpected::None,
            seqno: self.seqno + 1,
            expires_at,
            needs_write: false,
            replay: false,
            transmissions: 0,
        };

        if message.qos != QoS::AtMostOnce {
            message.len = self.persist(
                &persistence::pending_key(message.seqno),
                &message,
                StoredQueue::Pending,
            )?;
        }

        self.seqno = message.seqno;
        trace!(
            "Client {} queued message {} (seqno {}, {} pending)",
            self.client_id,
            msgid,
            message.seqno,
            self.pending.len() + 1
        );
        self.pending.push_back(message);
        Ok(msgid)
    }

    /// Whether the front pending entry could be admitted now
    pub fn can_admit(&self) -> bool {
        match self.pending.front() {
            Some(m) if m.qos == QoS::AtMostOnce => true,
            Some(_) => self.outbound.len() < self.limits.max_inflight,
            None => false,
        }
    }

    /// Move the front pending entry toward the transport, in FIFO order
    pub fn admit(&mut self, now: Instant) -> Result<Option<Admitted>, LedgerError> {
        if !self.can_admit() {
            return Ok(None);
        }
        let Some(mut message) = self.pending.pop_front() else {
            return Ok(None);
        };

        if message.qos == QoS::AtMostOnce {
            return Ok(Some(Admitted::AtMostOnce(message)));
        }

        message.next_expected = NextExpected::after_publish(message.qos);
        message.last_touch = now;
        let out_key = persistence::outbound_key(message.msgid);
        let pending_key = persistence::pending_key(message.seqno);

        let len = match self.persist(&out_key, &message, StoredQueue::Outbound) {
            Ok(len) => len,
            Err(e) => {
                message.next_expected = NextExpected::None;
                self.pending.push_front(message);
                return Err(e);
            }
        };
        if let Err(e) = self.unpersist(&pending_key) {
            // Restore prefers the outbound record if this also fails
            if let Err(undo) = self.unpersist(&out_key) {
                warn!(
                    "Client {} left duplicate records for seqno {}: {}",
                    self.client_id, message.seqno, undo
                );
            }
            message.next_expected = NextExpected::None;
            self.pending.push_front(message);
            return Err(e);
        }

        message.len = len;
        message.needs_write = true;
        let msgid = message.msgid;
        debug!(
            "Client {} admitted message {} ({}/{} in flight)",
            self.client_id,
            msgid,
            self.outbound.len() + 1,
            self.limits.max_inflight
        );
        self.outbound.push_back(message);
        Ok(Some(Admitted::InFlight(msgid)))
    }

    /// Put a QoS 0 entry back at the head of the pending queue
    pub fn requeue(&mut self, message: Message) {
        self.pending.push_front(message);
    }

    /// First outbound entry that still has to be written
    pub fn next_write(&self) -> Option<Outbound> {
        self.outbound
            .iter()
            .find(|m| m.needs_write)
            .map(Message::outbound_packet)
    }

    /// The packet for `msgid` reached the transport
    pub fn confirm_write(&mut self, msgid: u16, now: Instant) {
        if let Some(message) = self.outbound.iter_mut().find(|m| m.msgid == msgid) {
            message.needs_write = false;
            message.replay = false;
            message.transmissions += 1;
            message.last_touch = now;
        }
    }

    /// Flag every outbound entry for resending after a reconnect
    pub fn mark_replay(&mut self) -> usize {
        for message in self.outbound.iter_mut() {
            message.needs_write = true;
            message.replay = true;
        }
        self.outbound.len()
    }

    /// Entries of the reconnect resend sequence not yet written
    pub fn replay_outstanding(&self) -> usize {
        self.outbound.iter().filter(|m| m.replay).count()
    }

    /// Flag entries whose last activity is older than the retry interval
    pub fn mark_retries(&mut self, now: Instant) -> usize {
        let interval = self.limits.retry_interval;
        if interval.is_zero() {
            return 0;
        }
        let mut marked = 0;
        for message in self.outbound.iter_mut() {
            if !message.needs_write && now.saturating_duration_since(message.last_touch) >= interval
            {
                trace!(
                    "Client {} retrying message {} ({:?})",
                    self.client_id,
                    message.msgid,
                    message.next_expected
                );
                message.needs_write = true;
                marked += 1;
            }
        }
        marked
    }

    fn position(&self, msgid: u16) -> Option<usize> {
        self.outbound.iter().position(|m| m.msgid == msgid)
    }

    fn remove_outbound(&mut self, index: usize) -> Result<Message, LedgerError> {
        let msgid = self.outbound[index].msgid;
        self.unpersist(&persistence::outbound_key(msgid))?;
        self.outbound
            .remove(index)
            .ok_or_else(|| Self::unknown(PacketType::Publish, msgid))
    }

    fn unknown(packet: PacketType, packet_id: u16) -> LedgerError {
        LedgerError::Protocol(ProtocolError::UnknownPacketId { packet, packet_id })
    }

    fn check_stage(
        &mut self,
        index: usize,
        packet: PacketType,
        packet_id: u16,
    ) -> Result<Option<AckOutcome>, LedgerError> {
        let expected = self.outbound[index].next_expected.packet_type();
        if expected == Some(packet) {
            return Ok(None);
        }
        warn!(
            "Client {} got {:?} for message {} awaiting {:?}",
            self.client_id, packet, packet_id, expected
        );
        let message = self.remove_outbound(index)?;
        Ok(Some(AckOutcome::Violation {
            message,
            error: ProtocolError::UnexpectedAck {
                packet,
                packet_id,
                expected,
            },
        }))
    }

    fn reject_or_complete(&mut self, index: usize, ack: Ack) -> Result<AckOutcome, LedgerError> {
        let message = self.remove_outbound(index)?;
        if ack.is_failure() && message.version.is_v5() {
            debug!(
                "Client {} message {} rejected with reason 0x{:02x}",
                self.client_id, ack.packet_id, ack.reason_code
            );
            return Ok(AckOutcome::Rejected {
                message,
                reason_code: ack.reason_code,
            });
        }
        trace!("Client {} message {} delivered", self.client_id, ack.packet_id);
        Ok(AckOutcome::Delivered(message))
    }

    pub fn puback(&mut self, ack: Ack) -> Result<AckOutcome, LedgerError> {
        let index = self
            .position(ack.packet_id)
            .ok_or_else(|| Self::unknown(PacketType::PubAck, ack.packet_id))?;
        if let Some(violation) = self.check_stage(index, PacketType::PubAck, ack.packet_id)? {
            return Ok(violation);
        }
        self.reject_or_complete(index, ack)
    }

    pub fn pubrec(&mut self, ack: Ack, now: Instant) -> Result<AckOutcome, LedgerError> {
        let index = self
            .position(ack.packet_id)
            .ok_or_else(|| Self::unknown(PacketType::PubRec, ack.packet_id))?;
        if let Some(violation) = self.check_stage(index, PacketType::PubRec, ack.packet_id)? {
            return Ok(violation);
        }
        if ack.is_failure() && self.outbound[index].version.is_v5() {
            return self.reject_or_complete(index, ack);
        }

        let key = persistence::outbound_key(ack.packet_id);
        self.outbound[index].next_expected = NextExpected::PubComp;
        let persisted = self.persist(&key, &self.outbound[index], StoredQueue::Outbound);
        let message = &mut self.outbound[index];
        match persisted {
            Ok(len) => {
                message.len = len;
                message.last_touch = now;
                message.needs_write = true;
                message.transmissions = 0;
                Ok(AckOutcome::Released)
            }
            Err(e) => {
                message.next_expected = NextExpected::PubRec;
                Err(e)
            }
        }
    }

    pub fn pubcomp(&mut self, ack: Ack) -> Result<AckOutcome, LedgerError> {
        let index = self
            .position(ack.packet_id)
            .ok_or_else(|| Self::unknown(PacketType::PubComp, ack.packet_id))?;
        if let Some(violation) = self.check_stage(index, PacketType::PubComp, ack.packet_id)? {
            return Ok(violation);
        }
        self.reject_or_complete(index, ack)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Apply an inbound PUBLISH
    pub fn receive(
        &mut self,
        store: &PublicationStore,
        publish: InboundPublish,
        version: ProtocolVersion,
        now: Instant,
    ) -> Result<InboundOutcome, LedgerError> {
        let properties = if version.is_v5() {
            publish.properties
        } else {
            Properties::default()
        };

        let msgid = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, id) => id,
            (_, Some(id)) => Some(id),
            (_, None) => return Err(ProtocolError::MissingPacketId.into()),
        };

        match (publish.qos, msgid) {
            (QoS::ExactlyOnce, Some(id)) => {
                if self.inbound.iter().any(|m| m.msgid == id) {
                    debug!("Client {} duplicate QoS 2 message {}", self.client_id, id);
                    return Ok(InboundOutcome {
                        delivered: false,
                        reply: Some(Outbound::PubRec(Ack::new(id))),
                    });
                }
                let mut message = Message {
                    qos: QoS::ExactlyOnce,
                    retain: publish.retain,
                    msgid: id,
                    version,
                    properties,
                    publication: store.acquire(publish.topic, publish.payload),
                    last_touch: now,
                    next_expected: NextExpected::PubRel,
                    len: 0,
                    seqno: self.seqno + 1,
                    expires_at: None,
                    needs_write: false,
                    replay: false,
                    transmissions: 0,
                };
                message.len =
                    self.persist(&persistence::inbound_key(id), &message, StoredQueue::Inbound)?;
                self.seqno = message.seqno;
                self.inbound.push_back(message);
                Ok(InboundOutcome {
                    delivered: false,
                    reply: Some(Outbound::PubRec(Ack::new(id))),
                })
            }
            (qos, msgid) => {
                self.received.push_back(ReceivedMessage {
                    publication: store.acquire(publish.topic, publish.payload),
                    qos,
                    retain: publish.retain,
                    dup: publish.dup,
                    msgid,
                    properties,
                });
                let reply = match (qos, msgid) {
                    (QoS::AtLeastOnce, Some(id)) => Some(Outbound::PubAck(Ack::new(id))),
                    _ => None,
                };
                Ok(InboundOutcome {
                    delivered: true,
                    reply,
                })
            }
        }
    }

    /// Apply an inbound PUBREL; PUBCOMP is owed either way
    pub fn pubrel(
        &mut self,
        ack: Ack,
        version: ProtocolVersion,
    ) -> Result<InboundOutcome, LedgerError> {
        let Some(index) = self.inbound.iter().position(|m| m.msgid == ack.packet_id) else {
            debug!(
                "Client {} PUBREL for unknown message {}",
                self.client_id, ack.packet_id
            );
            let comp = if version.is_v5() {
                Ack::with_reason(ack.packet_id, REASON_PACKET_ID_NOT_FOUND)
            } else {
                Ack::new(ack.packet_id)
            };
            return Ok(InboundOutcome {
                delivered: false,
                reply: Some(Outbound::PubComp(comp)),
            });
        };

        self.unpersist(&persistence::inbound_key(ack.packet_id))?;
        let Some(message) = self.inbound.remove(index) else {
            return Err(Self::unknown(PacketType::PubRel, ack.packet_id));
        };
        self.received.push_back(ReceivedMessage {
            publication: message.publication,
            qos: message.qos,
            retain: message.retain,
            dup: false,
            msgid: Some(message.msgid),
            properties: message.properties,
        });
        Ok(InboundOutcome {
            delivered: true,
            reply: Some(Outbound::PubComp(Ack::new(ack.packet_id))),
        })
    }

    // ------------------------------------------------------------------
    // Expiry and discard
    // ------------------------------------------------------------------

    /// Drop entries whose message expiry has passed. Outbound entries past
    /// PUBREC belong to the peer and are kept.
    pub fn expire(&mut self, now: Instant) -> Result<Vec<Message>, LedgerError> {
        let mut expired = Vec::new();

        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].is_expired(now) {
                let message = &self.pending[i];
                if message.qos != QoS::AtMostOnce {
                    self.unpersist(&persistence::pending_key(message.seqno))?;
                }
                if let Some(message) = self.pending.remove(i) {
                    expired.push(message);
                }
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.outbound.len() {
            let message = &self.outbound[i];
            let owned_by_us = matches!(
                message.next_expected,
                NextExpected::PubAck | NextExpected::PubRec
            );
            if owned_by_us && message.is_expired(now) {
                expired.push(self.remove_outbound(i)?);
            } else {
                i += 1;
            }
        }

        for message in &expired {
            debug!(
                "Client {} message {} (seqno {}) expired",
                self.client_id, message.msgid, message.seqno
            );
        }
        Ok(expired)
    }

    /// Forget the in-flight state of both directions, along with its
    /// records. Pending publishes are the application's and stay queued.
    /// Returns the outbound entries so undelivered publishes can be reported.
    pub fn discard(&mut self) -> Result<Vec<Message>, LedgerError> {
        if self.persistence.is_enabled() {
            for message in &self.outbound {
                self.persistence
                    .remove(&persistence::outbound_key(message.msgid))?;
            }
            for message in &self.inbound {
                self.persistence
                    .remove(&persistence::inbound_key(message.msgid))?;
            }
        }
        let dropped: Vec<Message> = self.outbound.drain(..).collect();
        self.inbound.clear();
        if !dropped.is_empty() {
            debug!(
                "Client {} discarded {} unacknowledged messages",
                self.client_id,
                dropped.len()
            );
        }
        Ok(dropped)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Rebuild the queues from decoded records, in original order. Records
    /// with identical content share one publication.
    ///
    /// Records that fail their fingerprint or do not decode are deleted, as
    /// is the pending copy of an entry that was admitted before the crash.
    /// A ledger that already holds entries is left untouched.
    pub fn restore(
        &mut self,
        mut records: Vec<(String, StoredMessage)>,
        store: &PublicationStore,
        now: Instant,
    ) -> Result<usize, LedgerError> {
        if !(self.outbound.is_empty() && self.inbound.is_empty() && self.pending.is_empty()) {
            warn!(
                "Client {} already holds messages, not restoring",
                self.client_id
            );
            return Ok(0);
        }
        records.sort_by_key(|(_, r)| r.seqno);

        let mut stale = Vec::new();
        let mut decoded = Vec::with_capacity(records.len());
        for (key, mut record) in records {
            let queue = record.queue;
            let seqno = record.seqno;
            let topic = std::mem::take(&mut record.topic);
            let payload = std::mem::take(&mut record.payload);
            let publication = store.acquire_recovered(topic, payload);
            if publication.fingerprint() != record.fingerprint {
                warn!(
                    "Client {} dropping record {} with mismatched fingerprint (seqno {})",
                    self.client_id, key, seqno
                );
                stale.push(key);
                continue;
            }
            let Some(message) = Message::from_record(record, publication, now) else {
                warn!(
                    "Client {} dropping undecodable record {} (seqno {})",
                    self.client_id, key, seqno
                );
                stale.push(key);
                continue;
            };
            decoded.push((key, queue, message));
        }

        // An entry caught between pending and outbound keeps its outbound copy
        let admitted: FnvHashSet<u64> = decoded
            .iter()
            .filter(|(_, queue, _)| *queue == StoredQueue::Outbound)
            .map(|(_, _, message)| message.seqno)
            .collect();

        for (key, queue, message) in decoded {
            if queue == StoredQueue::Pending && admitted.contains(&message.seqno) {
                debug!(
                    "Client {} dropping pending copy {} of admitted message {}",
                    self.client_id, key, message.msgid
                );
                stale.push(key);
                continue;
            }

            self.seqno = self.seqno.max(message.seqno);
            match queue {
                StoredQueue::Outbound => {
                    self.next_msgid = message.msgid.checked_add(1).unwrap_or(1).max(1);
                    self.outbound.push_back(message);
                }
                StoredQueue::Pending => {
                    if message.qos != QoS::AtMostOnce {
                        self.next_msgid = message.msgid.checked_add(1).unwrap_or(1).max(1);
                    }
                    self.pending.push_back(message);
                }
                StoredQueue::Inbound => self.inbound.push_back(message),
            }
        }

        for key in &stale {
            self.persistence.remove(key)?;
        }

        let restored = self.outbound.len() + self.inbound.len() + self.pending.len();
        if restored > 0 {
            debug!(
                "Client {} restored {} outbound, {} inbound, {} pending",
                self.client_id,
                self.outbound.len(),
                self.inbound.len(),
                self.pending.len()
            );
        }
        Ok(restored)
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("client_id", &self.client_id)
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.len())
            .field("pending", &self.pending.len())
            .field("received", &self.received.len())
            .field("seqno", &self.seqno)
            .field("durable", &self.durable)
            .finish()
    }
}
