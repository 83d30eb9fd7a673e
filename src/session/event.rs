use std::fmt;
use std::sync::Arc;

use crate::protocol::{ProtocolError, QoS};

/// Why an outbound publish will not be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// MQTT 5 failure reason code on PUBACK or PUBREC
    Rejected(u8),
    /// Message expiry interval elapsed before the handshake finished
    Expired,
    /// Dropped by a clean start or the end of a non-persistent session
    Discarded,
    /// The peer acknowledged the wrong stage of the handshake
    ProtocolViolation(ProtocolError),
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryFailure::Rejected(code) => write!(f, "rejected (reason 0x{:02x})", code),
            DeliveryFailure::Expired => write!(f, "expired"),
            DeliveryFailure::Discarded => write!(f, "discarded"),
            DeliveryFailure::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
        }
    }
}

/// Notifications for the application actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        session_present: bool,
    },
    ConnectFailed {
        reason: String,
    },
    /// A live connection failed (transport error, keepalive timeout,
    /// server DISCONNECT)
    ConnectionLost {
        reason: String,
    },
    /// Application-initiated disconnect finished
    Disconnected,
    Delivered {
        msgid: u16,
        topic: Arc<str>,
    },
    DeliveryFailed {
        msgid: u16,
        topic: Arc<str>,
        reason: DeliveryFailure,
    },
    MessageArrived {
        topic: Arc<str>,
        qos: QoS,
    },
    PersistenceFailed {
        error: String,
    },
    /// The peer broke the protocol; the offending packet was not applied
    ProtocolViolation {
        error: ProtocolError,
    },
}
