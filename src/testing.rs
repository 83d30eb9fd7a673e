//! Test doubles shared by the unit tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::{Outbound, PacketType};
use crate::transport::{
    Progress, ProxySettings, TlsSettings, Transport, TransportError, TransportId,
    WebSocketSettings, WriteStatus,
};

/// Shared view of what a [`MockTransport`] was asked to do
#[derive(Clone, Default)]
pub(crate) struct MockHandle {
    written: Arc<Mutex<Vec<Outbound>>>,
    would_block: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockHandle {
    pub fn take_written(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.written.lock())
    }

    pub fn packet_types(&self) -> Vec<PacketType> {
        self.written.lock().iter().map(|p| p.packet_type()).collect()
    }

    /// (packet type, packet id) pairs in write order
    pub fn sent(&self) -> Vec<(PacketType, Option<u16>)> {
        self.written
            .lock()
            .iter()
            .map(|p| (p.packet_type(), p.packet_id()))
            .collect()
    }

    pub fn clear(&self) {
        self.written.lock().clear();
    }

    pub fn set_would_block(&self, blocked: bool) {
        self.would_block.store(blocked, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Scriptable in-memory transport
pub(crate) struct MockTransport {
    id: TransportId,
    pending: usize,
    fail: Option<&'static str>,
    steps: Vec<&'static str>,
    handle: MockHandle,
}

impl MockTransport {
    pub fn new(id: u64) -> Self {
        Self {
            id: TransportId(id),
            pending: 0,
            fail: None,
            steps: Vec::new(),
            handle: MockHandle::default(),
        }
    }

    /// The next `n` establishment calls report in-progress
    pub fn pending_steps(&mut self, n: usize) {
        self.pending = n;
    }

    pub fn fail_step(&mut self, step: &'static str) {
        self.fail = Some(step);
    }

    pub fn steps(&self) -> Vec<&'static str> {
        self.steps.clone()
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    fn step(&mut self, name: &'static str) -> Progress {
        self.steps.push(name);
        if self.pending > 0 {
            self.pending -= 1;
            return Progress::InProgress;
        }
        if self.fail == Some(name) {
            return Progress::Failed(match name {
                "proxy" => TransportError::Proxy("tunnel refused".to_string()),
                "tls" => TransportError::Tls("handshake failed".to_string()),
                "websocket" => TransportError::WebSocket("upgrade rejected".to_string()),
                _ => TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
            });
        }
        Progress::Complete
    }
}

impl Transport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn establish_proxy(&mut self, _proxy: &ProxySettings) -> Progress {
        self.step("proxy")
    }

    fn connect(&mut self) -> Progress {
        self.step("tcp")
    }

    fn start_tls(&mut self, _tls: &TlsSettings, _session: Option<&Bytes>) -> Progress {
        self.step("tls")
    }

    fn upgrade_websocket(&mut self, _ws: &WebSocketSettings) -> Progress {
        self.step("websocket")
    }

    fn write(&mut self, packet: &Outbound) -> Result<WriteStatus, TransportError> {
        if self.handle.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.handle.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        if self.handle.would_block.load(Ordering::SeqCst) {
            return Ok(WriteStatus::WouldBlock);
        }
        self.handle.written.lock().push(packet.clone());
        Ok(WriteStatus::Written)
    }

    fn tls_session(&self) -> Option<Bytes> {
        Some(Bytes::from_static(b"tls-session"))
    }

    fn close(&mut self) {
        self.handle.closed.store(true, Ordering::SeqCst);
    }
}
