//! Session error types

use std::fmt;

use crate::connection::InvalidTransition;
use crate::ledger::LedgerError;
use crate::persistence::PersistenceError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Errors surfaced to the actor that called into a session
#[derive(Debug)]
pub enum SessionError {
    /// The session is in DISCONNECTING and admits no new work
    Disconnecting,
    Protocol(ProtocolError),
    Persistence(PersistenceError),
    Transport(TransportError),
    NoMessageIdAvailable,
    InvalidState(InvalidTransition),
    /// The pending queue is at its configured bound
    QueueFull,
    /// No session is registered under this client identifier
    UnknownClient(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Disconnecting => write!(f, "session is disconnecting"),
            SessionError::Protocol(e) => write!(f, "protocol error: {}", e),
            SessionError::Persistence(e) => write!(f, "persistence error: {}", e),
            SessionError::Transport(e) => write!(f, "transport error: {}", e),
            SessionError::NoMessageIdAvailable => write!(f, "no message identifier available"),
            SessionError::InvalidState(e) => write!(f, "{}", e),
            SessionError::QueueFull => write!(f, "pending queue full"),
            SessionError::UnknownClient(id) => write!(f, "unknown client {}", id),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Protocol(e) => Some(e),
            SessionError::Persistence(e) => Some(e),
            SessionError::Transport(e) => Some(e),
            SessionError::InvalidState(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<PersistenceError> for SessionError {
    fn from(e: PersistenceError) -> Self {
        SessionError::Persistence(e)
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e)
    }
}

impl From<InvalidTransition> for SessionError {
    fn from(e: InvalidTransition) -> Self {
        SessionError::InvalidState(e)
    }
}

impl From<LedgerError> for SessionError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Protocol(e) => SessionError::Protocol(e),
            LedgerError::Persistence(e) => SessionError::Persistence(e),
            LedgerError::NoMessageIdAvailable => SessionError::NoMessageIdAvailable,
            LedgerError::QueueFull => SessionError::QueueFull,
        }
    }
}
