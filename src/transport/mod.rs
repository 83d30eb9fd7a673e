//! Transport Layer contract
//!
//! The socket, TLS, websocket and proxy implementations live outside this
//! crate. A session drives them through [`Transport`], whose establishment
//! steps are non-blocking: each call reports whether the step finished, is
//! still in progress (call again when the socket is ready), or failed.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;

use crate::protocol::Outbound;

/// Identity of a transport, used by the registry to route socket events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

/// Transport error types
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    /// HTTP proxy refused or failed the CONNECT tunnel
    Proxy(String),
    /// TLS handshake failure
    Tls(String),
    /// Websocket upgrade rejected
    WebSocket(String),
    /// Operation on a transport that has been closed or never attached
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "IO error: {}", e),
            TransportError::Proxy(msg) => write!(f, "Proxy error: {}", msg),
            TransportError::Tls(msg) => write!(f, "TLS error: {}", msg),
            TransportError::WebSocket(msg) => write!(f, "WebSocket error: {}", msg),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Outcome of one non-blocking establishment step
#[derive(Debug)]
pub enum Progress {
    Complete,
    InProgress,
    Failed(TransportError),
}

/// Outcome of a non-blocking write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    /// Send buffer full; retry when the socket becomes writable
    WouldBlock,
}

/// HTTP(S) proxy used to tunnel the broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub uri: String,
    /// `user:password` for Proxy-Authorization
    pub auth: Option<String>,
    /// true for an https:// proxy
    pub secure: bool,
}

/// TLS options for the broker connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub ca_file: Option<PathBuf>,
    pub server_name: Option<String>,
    pub verify: bool,
}

/// Websocket upgrade options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketSettings {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            path: "/mqtt".to_string(),
            headers: Vec::new(),
        }
    }
}

/// Byte-stream transport consumed by the session core
pub trait Transport: Send {
    fn id(&self) -> TransportId;

    /// Open (or continue opening) the tunnel through an HTTP proxy
    fn establish_proxy(&mut self, proxy: &ProxySettings) -> Progress;

    /// Open (or continue opening) the TCP connection to the broker
    fn connect(&mut self) -> Progress;

    /// Run (or continue) the TLS handshake, resuming `session` if given
    fn start_tls(&mut self, tls: &TlsSettings, session: Option<&Bytes>) -> Progress;

    /// Send (or await the response to) the websocket upgrade request
    fn upgrade_websocket(&mut self, ws: &WebSocketSettings) -> Progress;

    /// Encode and queue one packet
    fn write(&mut self, packet: &Outbound) -> Result<WriteStatus, TransportError>;

    /// TLS session data for fast reconnects, available after the handshake
    fn tls_session(&self) -> Option<Bytes> {
        None
    }

    /// `Sec-WebSocket-Key` sent with the upgrade request
    fn websocket_key(&self) -> Option<String> {
        None
    }

    fn close(&mut self);
}

/// Per-session transport state, never shared across sessions
pub struct NetworkHandle {
    transport: Option<Box<dyn Transport>>,
    pub last_sent: Instant,
    pub last_received: Instant,
    pub last_ping: Instant,
    /// Cached TLS session, kept across reconnects
    pub tls_session: Option<Bytes>,
    pub websocket_key: Option<String>,
}

impl NetworkHandle {
    pub fn new(now: Instant) -> Self {
        Self {
            transport: None,
            last_sent: now,
            last_received: now,
            last_ping: now,
            tls_session: None,
            websocket_key: None,
        }
    }

    /// Install a fresh transport, closing any previous one
    pub fn attach(&mut self, transport: Box<dyn Transport>, now: Instant) {
        self.release();
        self.transport = Some(transport);
        self.last_sent = now;
        self.last_received = now;
        self.last_ping = now;
        self.websocket_key = None;
    }

    /// Close and drop the transport
    pub fn release(&mut self) -> Option<TransportId> {
        let mut transport = self.transport.take()?;
        let id = transport.id();
        transport.close();
        Some(id)
    }

    pub fn id(&self) -> Option<TransportId> {
        self.transport.as_ref().map(|t| t.id())
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn transport_mut(&mut self) -> Result<&mut (dyn Transport + 'static), TransportError> {
        self.transport.as_deref_mut().ok_or(TransportError::Closed)
    }

    /// Write one packet, recording the send time when it was accepted
    pub fn write(&mut self, packet: &Outbound, now: Instant) -> Result<WriteStatus, TransportError> {
        let status = self.transport_mut()?.write(packet)?;
        if status == WriteStatus::Written {
            self.last_sent = now;
        }
        Ok(status)
    }
}

impl fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("transport", &self.id())
            .field("last_sent", &self.last_sent)
            .field("last_received", &self.last_received)
            .field("last_ping", &self.last_ping)
            .field("tls_session", &self.tls_session.is_some())
            .finish()
    }
}
