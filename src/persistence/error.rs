//! Persistence error types.

use std::fmt;

/// Failures of the record store or of a single record
#[derive(Debug)]
pub enum PersistenceError {
    /// The fjall keyspace or partition failed
    Store(fjall::Error),
    /// A record could not be encoded for writing
    Encode(bincode::error::EncodeError),
    /// The record under `key` does not decode
    Decode {
        key: String,
        source: bincode::error::DecodeError,
    },
    /// A before-write or after-read hook rejected the record
    Hook(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {}", e),
            Self::Encode(e) => write!(f, "cannot encode record: {}", e),
            Self::Decode { key, source } => write!(f, "cannot decode record {}: {}", key, source),
            Self::Hook(reason) => write!(f, "persistence hook error: {}", reason),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode { source, .. } => Some(source),
            Self::Hook(_) => None,
        }
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Store(err)
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err)
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
