//! Keepalive Scheduler
//!
//! Decides when a PINGREQ is owed and when a silent peer is dead. At most
//! one ping is outstanding; a ping that could not be written is remembered
//! as due and retried on the next opportunity instead of being dropped.

use std::time::{Duration, Instant};

/// What the session should do after polling the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    /// No PINGRESP within an interval of the ping, or a due ping could not
    /// be written for a whole interval
    Dead,
}

/// Keepalive bookkeeping for one session
#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    /// Configured value, restored when a server override ends
    saved_interval: Duration,
    ping_outstanding: bool,
    ping_due: bool,
    ping_due_time: Option<Instant>,
}

impl KeepAlive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            saved_interval: interval,
            ping_outstanding: false,
            ping_due: false,
            ping_due_time: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn saved_interval(&self) -> Duration {
        self.saved_interval
    }

    /// Apply a server keep alive (v5 CONNACK property)
    pub fn set_server_interval(&mut self, secs: u16) {
        self.interval = Duration::from_secs(secs as u64);
    }

    /// Forget per-connection state before a new connection starts
    pub fn reset(&mut self) {
        self.interval = self.saved_interval;
        self.ping_outstanding = false;
        self.ping_due = false;
        self.ping_due_time = None;
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding
    }

    pub fn ping_due(&self) -> bool {
        self.ping_due
    }

    pub fn ping_due_time(&self) -> Option<Instant> {
        self.ping_due_time
    }

    pub fn poll(
        &self,
        now: Instant,
        last_sent: Instant,
        last_received: Instant,
        last_ping: Instant,
    ) -> KeepAliveAction {
        if self.interval.is_zero() {
            return KeepAliveAction::Idle;
        }

        if self.ping_outstanding {
            if now.saturating_duration_since(last_ping) >= self.interval {
                return KeepAliveAction::Dead;
            }
            return KeepAliveAction::Idle;
        }

        if self.ping_due {
            let waited = self
                .ping_due_time
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            if waited >= self.interval {
                return KeepAliveAction::Dead;
            }
            return KeepAliveAction::SendPing;
        }

        if now.saturating_duration_since(last_sent) >= self.interval
            || now.saturating_duration_since(last_received) >= self.interval
        {
            return KeepAliveAction::SendPing;
        }

        KeepAliveAction::Idle
    }

    /// The PINGREQ was written
    pub fn ping_sent(&mut self) {
        self.ping_outstanding = true;
        self.ping_due = false;
        self.ping_due_time = None;
    }

    /// The PINGREQ could not be written; keep the obligation
    pub fn ping_blocked(&mut self, now: Instant) {
        self.ping_due = true;
        self.ping_due_time.get_or_insert(now);
    }

    /// PINGRESP arrived
    pub fn pong_received(&mut self) {
        self.ping_outstanding = false;
    }
}
