//! Protocol error types

use std::fmt;

use super::PacketType;

/// Handshake and sequencing violations detected by the session core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Acknowledgement for a packet identifier that has no in-flight entry
    UnknownPacketId { packet: PacketType, packet_id: u16 },
    /// Acknowledgement arrived for an entry waiting on a different stage
    UnexpectedAck {
        packet: PacketType,
        packet_id: u16,
        expected: Option<PacketType>,
    },
    /// CONNACK received while no connect attempt is waiting for it
    UnexpectedConnAck,
    /// Inbound PUBLISH with QoS > 0 but no packet identifier
    MissingPacketId,
    /// Server refused the connection with the given return/reason code
    ConnectionRefused(u8),
    /// Keep alive timeout
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPacketId { packet, packet_id } => {
                write!(f, "{:?} for unknown packet id {}", packet, packet_id)
            }
            Self::UnexpectedAck {
                packet,
                packet_id,
                expected,
            } => match expected {
                Some(expected) => write!(
                    f,
                    "{:?} for packet id {} while waiting for {:?}",
                    packet, packet_id, expected
                ),
                None => write!(
                    f,
                    "{:?} for packet id {} which expects no acknowledgement",
                    packet, packet_id
                ),
            },
            Self::UnexpectedConnAck => write!(f, "unexpected CONNACK"),
            Self::MissingPacketId => write!(f, "PUBLISH with QoS > 0 has no packet id"),
            Self::ConnectionRefused(code) => write!(f, "connection refused: {}", code),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
