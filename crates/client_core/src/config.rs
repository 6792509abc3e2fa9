use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use shared::protocol::DEFAULT_CHANNEL_PREFIX;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub broker_url: String,
    pub api_base_url: String,
    pub channel_prefix: String,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    /// Interval of outgoing heart-beats; zero disables them.
    pub heartbeat_interval: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            broker_url: "http://localhost:8080/ecommerce-server/api/v1/ws".into(),
            api_base_url: "http://localhost:8080/ecommerce-server/api/v1".into(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.into(),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    broker_url: Option<String>,
    api_base_url: Option<String>,
    channel_prefix: Option<String>,
    connect_timeout_ms: Option<u64>,
    publish_timeout_ms: Option<u64>,
    heartbeat_ms: Option<u64>,
}

/// Defaults, then the optional TOML file, then `CHAT__*` environment
/// variables.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ChatConfig> {
    let mut config = ChatConfig::default();

    if let Some(path) = path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        config.apply_toml(&raw)?;
    }

    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

impl ChatConfig {
    pub fn apply_toml(&mut self, raw: &str) -> anyhow::Result<()> {
        let file: FileConfig = toml::from_str(raw).context("invalid chat config")?;
        if let Some(v) = file.broker_url {
            self.broker_url = v;
        }
        if let Some(v) = file.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = file.channel_prefix {
            self.channel_prefix = v;
        }
        if let Some(v) = file.connect_timeout_ms {
            self.connect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.publish_timeout_ms {
            self.publish_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.heartbeat_ms {
            self.heartbeat_interval = Duration::from_millis(v);
        }
        Ok(())
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHAT__BROKER_URL") {
            self.broker_url = v;
        }
        if let Some(v) = lookup("CHAT__API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("CHAT__CHANNEL_PREFIX") {
            self.channel_prefix = v;
        }
        if let Some(ms) = parse_millis(&lookup, "CHAT__CONNECT_TIMEOUT_MS") {
            self.connect_timeout = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "CHAT__PUBLISH_TIMEOUT_MS") {
            self.publish_timeout = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "CHAT__HEARTBEAT_MS") {
            self.heartbeat_interval = ms;
        }
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(err) => {
            warn!(key, value = %raw, "ignoring invalid duration: {err}");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
