//! Configuration Module
//!
//! TOML configuration for mqlink with support for:
//! - Logging level
//! - Session parameters (protocol version, keepalive, in-flight limits)
//! - Connection plan (proxy, TLS, websocket)
//! - Ledger persistence
//! - Driver tick interval
//! - Environment variable overrides (MQLINK__* prefix)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::connection::ConnectPlan;
use crate::driver::DriverConfig;
use crate::protocol::{ProtocolVersion, QoS, WillMessage};
use crate::session::SessionOptions;
use crate::transport::{ProxySettings, TlsSettings, WebSocketSettings};

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Substitution pattern error
    Pattern(regex::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Pattern(e) => write!(f, "Pattern error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<regex::Error> for ConfigError {
    fn from(e: regex::Error) -> Self {
        ConfigError::Pattern(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Transport establishment
    pub connection: ConnectionConfig,
    /// Ledger persistence
    pub persistence: PersistenceConfig,
    /// Periodic driver
    pub driver: DriverSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 3 (MQTT 3.1), 4 (MQTT 3.1.1) or 5 (MQTT 5)
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
    /// Keep alive in seconds, 0 disables
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    /// Resend interval for unacknowledged messages (e.g., "20s"), 0 disables
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Maximum in-flight outbound messages
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Maximum queued publishes waiting for admission (0 = unbounded)
    pub max_pending: usize,
    #[serde(default = "default_true")]
    pub clean_start: bool,
    /// MQTT 5 session expiry in seconds
    pub session_expiry_interval: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<WillConfig>,
}

/// Will message published by the server on an unexpected disconnect
#[derive(Debug, Clone, Deserialize)]
pub struct WillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

fn default_protocol_version() -> u8 {
    4
}
fn default_keep_alive() -> u16 {
    60
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(20)
}
fn default_max_inflight() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            keep_alive: default_keep_alive(),
            retry_interval: default_retry_interval(),
            max_inflight: default_max_inflight(),
            max_pending: 0,
            clean_start: true,
            session_expiry_interval: 0,
            username: None,
            password: None,
            will: None,
        }
    }
}

impl SessionConfig {
    /// Session options with an empty connect plan
    pub fn to_options(&self) -> Result<SessionOptions, ConfigError> {
        let protocol_version = ProtocolVersion::from_u8(self.protocol_version).ok_or_else(|| {
            ConfigError::Validation(format!(
                "protocol_version must be 3, 4 or 5, got {}",
                self.protocol_version
            ))
        })?;
        let will = match &self.will {
            Some(will) => Some(WillMessage {
                topic: will.topic.clone(),
                payload: Bytes::from(will.payload.clone().into_bytes()),
                retain: will.retain,
                qos: QoS::from_u8(will.qos).ok_or_else(|| {
                    ConfigError::Validation("will qos must be 0, 1, or 2".to_string())
                })?,
            }),
            None => None,
        };

        Ok(SessionOptions {
            protocol_version,
            keep_alive: self.keep_alive,
            retry_interval: self.retry_interval,
            max_inflight: self.max_inflight,
            max_pending: self.max_pending,
            clean_start: self.clean_start,
            session_expiry_interval: self.session_expiry_interval,
            username: self.username.clone(),
            password: self
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
            will,
            plan: ConnectPlan::default(),
        })
    }
}

/// Transport establishment configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Proxy used for plain connections, e.g. "http://proxy:3128"
    pub http_proxy: Option<String>,
    /// Proxy used when TLS is configured
    pub https_proxy: Option<String>,
    /// "user:password" for proxy authentication
    pub proxy_auth: Option<String>,
    pub tls: Option<TlsConfig>,
    /// Upgrade to MQTT over websocket after the transport connects
    pub websocket: bool,
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
    /// Extra headers sent with the websocket upgrade
    pub http_headers: BTreeMap<String, String>,
}

/// TLS configuration for the client side of the connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to CA certificate file (PEM format)
    pub ca_file: Option<PathBuf>,
    /// Override for SNI and certificate verification
    pub server_name: Option<String>,
    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_file: None,
            server_name: None,
            verify: true,
        }
    }
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            http_proxy: None,
            https_proxy: None,
            proxy_auth: None,
            tls: None,
            websocket: false,
            websocket_path: default_ws_path(),
            http_headers: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Stages to run before the CONNECT packet
    pub fn to_plan(&self) -> ConnectPlan {
        let (proxy_uri, secure) = match (&self.tls, &self.https_proxy, &self.http_proxy) {
            (Some(_), Some(https), _) => (Some(https), true),
            (_, _, Some(http)) => (Some(http), false),
            (None, Some(https), None) => (Some(https), true),
            _ => (None, false),
        };

        ConnectPlan {
            proxy: proxy_uri.map(|uri| ProxySettings {
                uri: uri.clone(),
                auth: self.proxy_auth.clone(),
                secure,
            }),
            tls: self.tls.as_ref().map(|tls| TlsSettings {
                ca_file: tls.ca_file.clone(),
                server_name: tls.server_name.clone(),
                verify: tls.verify,
            }),
            websocket: self.websocket.then(|| WebSocketSettings {
                path: self.websocket_path.clone(),
                headers: self
                    .http_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Persist ledger records of sessions that retain state
    pub enabled: bool,
    /// Data directory path (for fjall)
    pub path: PathBuf,
    /// A failed write drops the connection instead of degrading to memory
    pub mandatory: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./data"),
            mandatory: false,
        }
    }
}

/// Periodic driver configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Tick interval (e.g., "500ms", "1s")
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Capacity of the session event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(500)
}
fn default_event_capacity() -> usize {
    1024
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl DriverSettings {
    pub fn to_driver_config(&self) -> DriverConfig {
        DriverConfig {
            tick_interval: self.tick_interval,
            event_capacity: self.event_capacity,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQLINK__` prefix with double underscores for nesting:
    ///    - `MQLINK__SESSION__KEEP_ALIVE=30` overrides `session.keep_alive`
    ///    - `MQLINK__PERSISTENCE__ENABLED=true` overrides `persistence.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("session.protocol_version", 4)?
            .set_default("session.keep_alive", 60)?
            .set_default("session.retry_interval", "20s")?
            .set_default("session.max_inflight", 10)?
            .set_default("session.max_pending", 0)?
            .set_default("session.clean_start", true)?
            .set_default("session.session_expiry_interval", 0)?
            .set_default("connection.websocket", false)?
            .set_default("connection.websocket_path", "/mqtt")?
            .set_default("persistence.enabled", false)?
            .set_default("persistence.path", "./data")?
            .set_default("persistence.mandatory", false)?
            .set_default("driver.tick_interval", "500ms")?
            .set_default("driver.event_capacity", 1024)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if ProtocolVersion::from_u8(self.session.protocol_version).is_none() {
            return Err(ConfigError::Validation(format!(
                "protocol_version must be 3, 4 or 5, got {}",
                self.session.protocol_version
            )));
        }

        if self.session.max_inflight == 0 || self.session.max_inflight > u16::MAX as usize {
            return Err(ConfigError::Validation(
                "max_inflight must be between 1 and 65535".to_string(),
            ));
        }

        if let Some(will) = &self.session.will {
            if will.topic.is_empty() {
                return Err(ConfigError::Validation(
                    "will topic must not be empty".to_string(),
                ));
            }
            if will.qos > 2 {
                return Err(ConfigError::Validation(
                    "will qos must be 0, 1, or 2".to_string(),
                ));
            }
        }

        if self.session.session_expiry_interval > 0 && self.session.protocol_version != 5 {
            return Err(ConfigError::Validation(
                "session_expiry_interval requires protocol_version 5".to_string(),
            ));
        }

        for proxy in [&self.connection.http_proxy, &self.connection.https_proxy]
            .into_iter()
            .flatten()
        {
            if !proxy.starts_with("http://") && !proxy.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "proxy '{}' must be an http:// or https:// URI",
                    proxy
                )));
            }
        }

        if self.connection.websocket && !self.connection.websocket_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "websocket_path must start with '/'".to_string(),
            ));
        }

        if self.persistence.enabled && self.persistence.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "persistence.path is required when persistence is enabled".to_string(),
            ));
        }

        if self.driver.tick_interval.is_zero() {
            return Err(ConfigError::Validation(
                "driver.tick_interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Session options including the connect plan
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        let mut options = self.session.to_options()?;
        options.plan = self.connection.to_plan();
        Ok(options)
    }
}
