//! Serializable ledger records.
//!
//! These are storage-friendly versions of ledger entries that can be
//! serialized with bincode.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};

use crate::protocol::Properties;

/// Which queue a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum StoredQueue {
    /// Outbound in-flight (key `s-<id>`)
    Outbound,
    /// Inbound in-flight (key `r-<id>`)
    Inbound,
    /// Outbound waiting for an in-flight slot (key `q-<seqno>`)
    Pending,
}

/// Stored ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub queue: StoredQueue,
    /// Session sequence number; restores original ordering
    pub seqno: u64,
    pub qos: u8,
    pub retain: bool,
    pub message_id: u16,
    pub protocol_version: u8,
    /// Packet type code of the next expected packet, 0 for none
    pub next_expected: u8,
    pub topic: String,
    pub payload: Vec<u8>,
    pub fingerprint: u64,
    pub properties: StoredProperties,
    /// Unix timestamp after which the message must not be delivered
    pub expires_at_secs: Option<u64>,
}

/// Stored MQTT v5 properties (subset relevant for persistence)
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

// ============================================================================
// Conversion implementations
// ============================================================================

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Convert a monotonic deadline to an approximate Unix timestamp
pub fn instant_to_unix_secs(instant: Instant) -> u64 {
    let now = Instant::now();
    let now_unix = now_unix_secs();

    if instant >= now {
        now_unix + instant.duration_since(now).as_secs()
    } else {
        now_unix.saturating_sub(now.duration_since(instant).as_secs())
    }
}

/// Convert a Unix timestamp back to a monotonic deadline
pub fn unix_secs_to_instant(secs: u64) -> Instant {
    let now = Instant::now();
    let now_unix = now_unix_secs();

    if secs >= now_unix {
        now + Duration::from_secs(secs - now_unix)
    } else {
        now.checked_sub(Duration::from_secs(now_unix - secs))
            .unwrap_or(now)
    }
}

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            user_properties: props.user_properties.clone(),
        }
    }
}

impl From<StoredProperties> for Properties {
    fn from(stored: StoredProperties) -> Self {
        Properties {
            payload_format_indicator: stored.payload_format_indicator,
            message_expiry_interval: stored.message_expiry_interval,
            content_type: stored.content_type,
            response_topic: stored.response_topic,
            correlation_data: stored.correlation_data.map(bytes::Bytes::from),
            user_properties: stored.user_properties,
            ..Default::default()
        }
    }
}
