//! Connection State Machine
//!
//! Sequences one connection attempt: optional proxy tunnel or plain TCP,
//! then optional TLS, optional websocket upgrade, and finally the wait for
//! CONNACK. The numeric state codes are observable and must stay stable.

use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::transport::{
    Progress, ProxySettings, TlsSettings, Transport, TransportError, WebSocketSettings,
};

/// Connection attempt state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i8)]
pub enum ConnectState {
    /// No attempt in progress; see the session's connected flag
    #[default]
    NotInProgress = 0,
    TcpInProgress = 1,
    SslInProgress = 2,
    WebSocketInProgress = 3,
    /// Transport ready, CONNECT sent, waiting for CONNACK
    WaitForConnAck = 4,
    ProxyConnectInProgress = 5,
    /// Tearing down; no further events are dispatched to this connection
    Disconnecting = -2,
}

impl ConnectState {
    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(ConnectState::NotInProgress),
            1 => Some(ConnectState::TcpInProgress),
            2 => Some(ConnectState::SslInProgress),
            3 => Some(ConnectState::WebSocketInProgress),
            4 => Some(ConnectState::WaitForConnAck),
            5 => Some(ConnectState::ProxyConnectInProgress),
            -2 => Some(ConnectState::Disconnecting),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectState::NotInProgress => "NOT_IN_PROGRESS",
            ConnectState::TcpInProgress => "TCP_IN_PROGRESS",
            ConnectState::SslInProgress => "SSL_IN_PROGRESS",
            ConnectState::WebSocketInProgress => "WEBSOCKET_IN_PROGRESS",
            ConnectState::WaitForConnAck => "WAIT_FOR_CONNACK",
            ConnectState::ProxyConnectInProgress => "PROXY_CONNECT_IN_PROGRESS",
            ConnectState::Disconnecting => "DISCONNECTING",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Which optional layers a connection goes through
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectPlan {
    pub proxy: Option<ProxySettings>,
    pub tls: Option<TlsSettings>,
    pub websocket: Option<WebSocketSettings>,
}

impl ConnectPlan {
    pub fn first_state(&self) -> ConnectState {
        if self.proxy.is_some() {
            ConnectState::ProxyConnectInProgress
        } else {
            ConnectState::TcpInProgress
        }
    }

    /// State entered once `state` has completed
    pub fn next_after(&self, state: ConnectState) -> ConnectState {
        match state {
            ConnectState::ProxyConnectInProgress | ConnectState::TcpInProgress
                if self.tls.is_some() =>
            {
                ConnectState::SslInProgress
            }
            ConnectState::ProxyConnectInProgress
            | ConnectState::TcpInProgress
            | ConnectState::SslInProgress
                if self.websocket.is_some() =>
            {
                ConnectState::WebSocketInProgress
            }
            ConnectState::ProxyConnectInProgress
            | ConnectState::TcpInProgress
            | ConnectState::SslInProgress
            | ConnectState::WebSocketInProgress => ConnectState::WaitForConnAck,
            other => other,
        }
    }
}

/// Result of driving the establishment stages
#[derive(Debug)]
pub enum Drive {
    /// A stage is still in progress; drive again on socket readiness
    Pending,
    /// Transport is ready; the caller sends CONNECT
    ReadyForConnect,
    /// Nothing to drive in the current state
    Idle,
    Failed(TransportError),
}

/// Rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectState,
    pub action: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} from {}", self.action, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// Per-session connection state machine
#[derive(Debug, Default)]
pub struct ConnectionMachine {
    state: ConnectState,
    plan: ConnectPlan,
}

impl ConnectionMachine {
    pub fn new(plan: ConnectPlan) -> Self {
        Self {
            state: ConnectState::NotInProgress,
            plan,
        }
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn plan(&self) -> &ConnectPlan {
        &self.plan
    }

    fn enter(&mut self, next: ConnectState) {
        if next != self.state {
            trace!("Connect state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Start a new attempt
    pub fn begin(&mut self) -> Result<ConnectState, InvalidTransition> {
        match self.state {
            ConnectState::NotInProgress | ConnectState::Disconnecting => {
                let first = self.plan.first_state();
                self.enter(first);
                Ok(first)
            }
            from => Err(InvalidTransition {
                from,
                action: "begin a connection attempt",
            }),
        }
    }

    /// Run establishment stages until one is pending, fails, or the
    /// transport is ready for the MQTT CONNECT.
    pub fn drive(&mut self, transport: &mut dyn Transport, tls_session: Option<&Bytes>) -> Drive {
        loop {
            let progress = match self.state {
                ConnectState::ProxyConnectInProgress => match &self.plan.proxy {
                    Some(proxy) => transport.establish_proxy(proxy),
                    None => Progress::Complete,
                },
                ConnectState::TcpInProgress => transport.connect(),
                ConnectState::SslInProgress => match &self.plan.tls {
                    Some(tls) => transport.start_tls(tls, tls_session),
                    None => Progress::Complete,
                },
                ConnectState::WebSocketInProgress => match &self.plan.websocket {
                    Some(ws) => transport.upgrade_websocket(ws),
                    None => Progress::Complete,
                },
                ConnectState::WaitForConnAck
                | ConnectState::NotInProgress
                | ConnectState::Disconnecting => return Drive::Idle,
            };

            match progress {
                Progress::InProgress => return Drive::Pending,
                Progress::Failed(e) => {
                    debug!("Connect stage {} failed: {}", self.state, e);
                    self.enter(ConnectState::NotInProgress);
                    return Drive::Failed(e);
                }
                Progress::Complete => {
                    let next = self.plan.next_after(self.state);
                    self.enter(next);
                    if next == ConnectState::WaitForConnAck {
                        return Drive::ReadyForConnect;
                    }
                }
            }
        }
    }

    /// CONNACK accepted: the attempt is over and the session is live
    pub fn connack_accepted(&mut self) -> Result<(), InvalidTransition> {
        if self.state != ConnectState::WaitForConnAck {
            return Err(InvalidTransition {
                from: self.state,
                action: "accept CONNACK",
            });
        }
        self.enter(ConnectState::NotInProgress);
        Ok(())
    }

    /// Abort the attempt (or live connection) after a transport failure
    pub fn fail(&mut self) {
        if self.state != ConnectState::Disconnecting {
            self.enter(ConnectState::NotInProgress);
        }
    }

    /// Enter DISCONNECTING; reachable from every state
    pub fn begin_disconnect(&mut self) {
        self.enter(ConnectState::Disconnecting);
    }
}
