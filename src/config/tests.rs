//! Config module tests

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("MQLINK_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${MQLINK_TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("MQLINK_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("MQLINK_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${MQLINK_TEST_VAR_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("MQLINK_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${MQLINK_TEST_VAR_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("MQLINK_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("MQLINK_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${MQLINK_TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("mqlink.toml");

    std::env::set_var("MQLINK_TEST_KEEP_ALIVE", "15");
    let config_content = r#"
[session]
keep_alive = ${MQLINK_TEST_KEEP_ALIVE}
max_inflight = ${MQLINK_TEST_INFLIGHT:-4}
retry_interval = "5s"

[driver]
tick_interval = "250ms"
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.session.keep_alive, 15);
    assert_eq!(config.session.max_inflight, 4);
    assert_eq!(config.session.retry_interval, Duration::from_secs(5));
    assert_eq!(config.driver.tick_interval, Duration::from_millis(250));

    std::env::remove_var("MQLINK_TEST_KEEP_ALIVE");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.session.protocol_version, 4);
    assert_eq!(config.session.retry_interval, Duration::from_secs(20));
    assert!(!config.persistence.enabled);
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.session.keep_alive, 60);
    assert_eq!(config.session.max_inflight, 10);
    assert_eq!(config.session.max_pending, 0);
    assert!(config.session.clean_start);
    assert_eq!(config.connection.websocket_path, "/mqtt");
    assert_eq!(config.driver.tick_interval, Duration::from_millis(500));
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[session]
protocol_version = 5
keep_alive = 30
retry_interval = "10s"
max_inflight = 20
max_pending = 100
clean_start = false
session_expiry_interval = 3600
username = "device"
password = "secret"

[session.will]
topic = "devices/1/status"
payload = "offline"
qos = 1
retain = true

[connection]
https_proxy = "https://proxy.local:3128"
proxy_auth = "user:pass"
websocket = true
websocket_path = "/ws"

[connection.tls]
server_name = "broker.local"

[connection.http_headers]
Authorization = "Bearer token"

[persistence]
enabled = true
path = "/var/lib/mqlink"
mandatory = true
"#,
    )
    .unwrap();

    let options = config.session_options().unwrap();
    assert_eq!(options.protocol_version, ProtocolVersion::V5);
    assert_eq!(options.keep_alive, 30);
    assert_eq!(options.retry_interval, Duration::from_secs(10));
    assert_eq!(options.max_pending, 100);
    assert!(options.retains_state());
    assert_eq!(options.password, Some(Bytes::from_static(b"secret")));

    let will = options.will.unwrap();
    assert_eq!(will.topic, "devices/1/status");
    assert_eq!(will.qos, QoS::AtLeastOnce);
    assert!(will.retain);

    let plan = options.plan;
    let proxy = plan.proxy.unwrap();
    assert_eq!(proxy.uri, "https://proxy.local:3128");
    assert!(proxy.secure);
    assert_eq!(proxy.auth.as_deref(), Some("user:pass"));
    let tls = plan.tls.unwrap();
    assert!(tls.verify);
    assert_eq!(tls.server_name.as_deref(), Some("broker.local"));
    let ws = plan.websocket.unwrap();
    assert_eq!(ws.path, "/ws");
    assert_eq!(
        ws.headers,
        vec![("Authorization".to_string(), "Bearer token".to_string())]
    );

    assert!(config.persistence.mandatory);
}

#[test]
fn test_plan_prefers_http_proxy_without_tls() {
    let connection = ConnectionConfig {
        http_proxy: Some("http://plain:8080".to_string()),
        https_proxy: Some("https://secure:8443".to_string()),
        ..Default::default()
    };
    let plan = connection.to_plan();
    let proxy = plan.proxy.unwrap();
    assert_eq!(proxy.uri, "http://plain:8080");
    assert!(!proxy.secure);
    assert!(plan.tls.is_none());
    assert!(plan.websocket.is_none());
}

#[test]
fn test_invalid_protocol_version() {
    let result = Config::parse(
        r#"
[session]
protocol_version = 6
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_max_inflight() {
    let result = Config::parse(
        r#"
[session]
max_inflight = 0
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_session_expiry_requires_v5() {
    let result = Config::parse(
        r#"
[session]
session_expiry_interval = 60
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_will_qos() {
    let result = Config::parse(
        r#"
[session.will]
topic = "t"
qos = 3
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_proxy_scheme() {
    let result = Config::parse(
        r#"
[connection]
http_proxy = "socks5://proxy:1080"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_driver_settings_conversion() {
    let config = Config::parse(
        r#"
[driver]
tick_interval = "2s"
event_capacity = 16
"#,
    )
    .unwrap();
    let driver = config.driver.to_driver_config();
    assert_eq!(driver.tick_interval, Duration::from_secs(2));
    assert_eq!(driver.event_capacity, 16);
}
