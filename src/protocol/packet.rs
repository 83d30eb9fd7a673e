//! Packets exchanged with the codec layer
//!
//! `Outbound` is what the session hands to its transport for encoding,
//! `Inbound` is what the codec hands back after decoding. Both are
//! version-neutral: v3.x peers simply never see properties or reason codes.

use std::sync::Arc;

use bytes::Bytes;

use super::{PacketType, Properties, ProtocolVersion, QoS};
use crate::publication::PublicationRef;

/// Reason code used by v5 acknowledgements for success
pub const REASON_SUCCESS: u8 = 0x00;
/// v5 PUBREL/PUBCOMP reason for an identifier the receiver does not know
pub const REASON_PACKET_ID_NOT_FOUND: u8 = 0x92;

/// Will message attached to a connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub qos: QoS,
}

/// Everything the codec needs to build a CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: ProtocolVersion,
    pub client_id: Arc<str>,
    /// Clean session (v3.x) / Clean start (v5.0)
    pub clean_start: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<WillMessage>,
    /// Session expiry interval (v5.0 only)
    pub session_expiry_interval: u32,
}

/// A PUBLISH on its way to the peer
#[derive(Debug, Clone)]
pub struct OutboundPublish {
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<u16>,
    pub qos: QoS,
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
    pub publication: PublicationRef,
    pub properties: Properties,
}

/// Packets the session asks the transport to write
#[derive(Debug, Clone)]
pub enum Outbound {
    Connect(Box<ConnectRequest>),
    Publish(OutboundPublish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    PingReq,
    Disconnect,
}

impl Outbound {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Outbound::Connect(_) => PacketType::Connect,
            Outbound::Publish(_) => PacketType::Publish,
            Outbound::PubAck(_) => PacketType::PubAck,
            Outbound::PubRec(_) => PacketType::PubRec,
            Outbound::PubRel(_) => PacketType::PubRel,
            Outbound::PubComp(_) => PacketType::PubComp,
            Outbound::PingReq => PacketType::PingReq,
            Outbound::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier, if the packet carries one
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Outbound::Publish(p) => p.packet_id,
            Outbound::PubAck(a)
            | Outbound::PubRec(a)
            | Outbound::PubRel(a)
            | Outbound::PubComp(a) => Some(a.packet_id),
            _ => None,
        }
    }
}

/// PUBACK / PUBREC / PUBREL / PUBCOMP body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub packet_id: u16,
    /// Reason code (v5.0 only, success otherwise)
    pub reason_code: u8,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: REASON_SUCCESS,
        }
    }

    pub fn with_reason(packet_id: u16, reason_code: u8) -> Self {
        Self {
            packet_id,
            reason_code,
        }
    }

    /// v5 reason codes of 0x80 and above report failure
    pub fn is_failure(&self) -> bool {
        self.reason_code >= 0x80
    }
}

/// CONNACK as seen by the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    /// Return code (v3.x) / reason code (v5.0)
    pub code: u8,
    pub properties: Properties,
}

impl ConnAck {
    pub fn accepted(session_present: bool) -> Self {
        Self {
            session_present,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// A PUBLISH received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub properties: Properties,
}

impl InboundPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            packet_id: None,
            properties: Properties::default(),
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }
}

/// Decoded packets the network actor delivers to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    ConnAck(ConnAck),
    Publish(InboundPublish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    PingResp,
    /// Server-initiated DISCONNECT (v5.0)
    Disconnect { reason_code: u8 },
}

impl Inbound {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Inbound::ConnAck(_) => PacketType::ConnAck,
            Inbound::Publish(_) => PacketType::Publish,
            Inbound::PubAck(_) => PacketType::PubAck,
            Inbound::PubRec(_) => PacketType::PubRec,
            Inbound::PubRel(_) => PacketType::PubRel,
            Inbound::PubComp(_) => PacketType::PubComp,
            Inbound::PingResp => PacketType::PingResp,
            Inbound::Disconnect { .. } => PacketType::Disconnect,
        }
    }
}
