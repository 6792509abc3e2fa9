use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

#[test]
fn defaults_point_at_local_broker() {
    let config = ChatConfig::default();
    assert_eq!(
        config.broker_url,
        "http://localhost:8080/ecommerce-server/api/v1/ws"
    );
    assert_eq!(config.channel_prefix, "/topic/conversation");
    assert_eq!(config.publish_timeout, Duration::from_secs(5));
}

#[test]
fn toml_overrides_only_present_keys() {
    let mut config = ChatConfig::default();
    config
        .apply_toml("broker_url = \"wss://chat.example/ws\"\nconnect_timeout_ms = 250\n")
        .expect("apply toml");
    assert_eq!(config.broker_url, "wss://chat.example/ws");
    assert_eq!(config.connect_timeout, Duration::from_millis(250));
    assert_eq!(config.api_base_url, ChatConfig::default().api_base_url);
}

#[test]
fn invalid_toml_is_an_error() {
    let mut config = ChatConfig::default();
    assert!(config.apply_toml("connect_timeout_ms = \"soon\"").is_err());
}

#[test]
fn env_wins_and_bad_numbers_are_ignored() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("CHAT__API_BASE_URL", "http://api.example"),
        ("CHAT__HEARTBEAT_MS", "0"),
        ("CHAT__PUBLISH_TIMEOUT_MS", "later"),
    ]);
    let mut config = ChatConfig::default();
    config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(config.api_base_url, "http://api.example");
    assert_eq!(config.heartbeat_interval, Duration::ZERO);
    assert_eq!(config.publish_timeout, Duration::from_secs(5));
}

#[test]
fn load_config_reads_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("chat_config_test_{suffix}.toml"));
    fs::write(&path, "channel_prefix = \"/queue/dm\"\n").expect("write config");

    let config = load_config(Some(&path)).expect("load");
    assert_eq!(config.channel_prefix, "/queue/dm");

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn load_config_reports_missing_file() {
    let err = load_config(Some(Path::new("/nonexistent/chat.toml"))).expect_err("must fail");
    assert!(err.to_string().contains("failed to read config file"));
}
