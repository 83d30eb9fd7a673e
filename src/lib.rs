//! mqlink - MQTT v3.1/v3.1.1/v5.0 client session core
//!
//! Tracks in-flight QoS handshakes, admits queued publishes under an
//! in-flight limit, persists the ledger for sessions that outlive their
//! connection, and drives keepalive and retries. Packet encoding and socket
//! I/O stay behind the [`transport::Transport`] trait.

pub mod config;
pub mod connection;
pub mod driver;
pub mod keepalive;
pub mod ledger;
pub mod persistence;
pub mod protocol;
pub mod publication;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use connection::{ConnectPlan, ConnectState};
pub use driver::{Driver, DriverConfig};
pub use ledger::PublishRequest;
pub use persistence::{FjallBackend, MemoryStore, Persistence, PersistenceHooks, Store};
pub use protocol::{ProtocolVersion, QoS};
pub use publication::PublicationStore;
pub use registry::SessionRegistry;
pub use session::{Session, SessionError, SessionEvent, SessionHandle, SessionOptions};
