//! MQTT v5.0 properties carried by in-flight messages
//!
//! The session core only interprets the expiry and keep alive values; the
//! rest travel untouched between the application, the ledger and storage.

use std::time::Duration;

use bytes::Bytes;

/// Property subset relevant to publishes and CONNACK handling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    /// Seconds the message stays deliverable after it was accepted
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
    /// Keep alive imposed by the server (CONNACK only)
    pub server_keep_alive: Option<u16>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    pub fn message_expiry(&self) -> Option<Duration> {
        self.message_expiry_interval
            .map(|secs| Duration::from_secs(secs as u64))
    }
}
