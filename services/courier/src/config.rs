//! Configuration handling for courier sessions.
//!
//! Settings come from a YAML file with a flat `session:` map of string values
//! and are then overridden from `COURIER_*` environment variables. Durations
//! use humantime syntax (`250ms`, `10s`, `1m`).

use anyhow::{bail, Context, Result};
use courier_session::SessionConfig;
use courier_wire::MAX_CONTAINER_MESSAGES;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Keys accepted in the `session:` map, also used for `COURIER_<KEY>` overrides
const SESSION_KEYS: &[&str] = &[
    "id_window_capacity",
    "resend_timeout",
    "resend_waiting",
    "container_lifetime",
    "resend_threshold",
    "sweep_interval",
    "ping_interval",
    "ping_timeout",
    "ack_wait",
    "resend_delay",
    "max_container_messages",
    "event_capacity",
    "layer",
];

/// Courier configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CourierConfig {
    /// Log level for the courier crates (trace, debug, info, warn, error)
    pub log_level: String,
    /// Session tunables
    pub session: SessionConfig,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            session: SessionConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    log_level: Option<String>,
    session: Option<HashMap<String, String>>,
}

impl CourierConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Final courier configuration: log_level={}, id_window={}, resend_timeout={:?}, ping_interval={:?}",
            config.log_level,
            config.session.id_window_capacity,
            config.session.resend_timeout,
            config.session.ping_interval
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(level) = root_config.log_level {
            self.log_level = level;
        }

        for (key, value) in root_config.session.unwrap_or_default() {
            if let Err(e) = self.set_session_value(&key, &value) {
                warn!("Ignoring session.{}: {:#}", key, e);
            }
        }
    }

    /// Apply `COURIER_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("COURIER_LOG_LEVEL") {
            info!("Log level overridden by environment: {}", level);
            self.log_level = level;
        }

        for key in SESSION_KEYS {
            let variable = format!("COURIER_{}", key.to_uppercase());
            let Some(value) = lookup(&variable) else {
                continue;
            };
            match self.set_session_value(key, &value) {
                Ok(()) => info!("{} overridden by environment: {}", key, value),
                Err(e) => warn!("Ignoring {}: {:#}", variable, e),
            }
        }
    }

    /// Set one session tunable from its string form
    pub fn set_session_value(&mut self, key: &str, value: &str) -> Result<()> {
        let session = &mut self.session;
        match key {
            "id_window_capacity" => session.id_window_capacity = parse_number(value)?,
            "resend_timeout" => session.resend_timeout = parse_duration(value)?,
            "resend_waiting" => session.resend_waiting = parse_duration(value)?,
            "container_lifetime" => session.container_lifetime = parse_duration(value)?,
            "resend_threshold" => session.resend_threshold = parse_number(value)?,
            "sweep_interval" => session.sweep_interval = parse_duration(value)?,
            "ping_interval" => session.ping_interval = parse_duration(value)?,
            "ping_timeout" => session.ping_timeout = parse_duration(value)?,
            "ack_wait" => session.ack_wait = parse_duration(value)?,
            "resend_delay" => session.resend_delay = parse_duration(value)?,
            "max_container_messages" => session.max_container_messages = parse_number(value)?,
            "event_capacity" => session.event_capacity = parse_number(value)?,
            "layer" => {
                session.layer = value
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid layer {:?}", value))?
            }
            _ => bail!("unknown key"),
        }
        Ok(())
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.id_window_capacity == 0 {
            bail!("id_window_capacity must be positive");
        }
        if session.max_container_messages == 0
            || session.max_container_messages > MAX_CONTAINER_MESSAGES
        {
            bail!(
                "max_container_messages must be within 1..={}",
                MAX_CONTAINER_MESSAGES
            );
        }
        if session.event_capacity == 0 {
            bail!("event_capacity must be positive");
        }
        if session.sweep_interval.is_zero() || session.ping_interval.is_zero() {
            bail!("sweep_interval and ping_interval must be positive");
        }
        if session.ping_timeout < session.ping_interval {
            warn!(
                "ping_timeout {:?} is shorter than ping_interval {:?}",
                session.ping_timeout, session.ping_interval
            );
        }
        Ok(())
    }
}

fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).with_context(|| format!("invalid duration {:?}", value))
}

fn parse_number(value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid number {:?}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CourierConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.session.id_window_capacity, 400);
        assert_eq!(config.session.resend_timeout, Duration::from_secs(10));
        assert_eq!(config.session.ping_timeout, Duration::from_secs(75));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
log_level: debug
session:
  id_window_capacity: "800"
  resend_timeout: "5s"
  ack_wait: "250ms"
  max_container_messages: "64"
  unknown_key: "whatever"
  ping_interval: "not-a-duration"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = CourierConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.session.id_window_capacity, 800);
        assert_eq!(config.session.resend_timeout, Duration::from_secs(5));
        assert_eq!(config.session.ack_wait, Duration::from_millis(250));
        assert_eq!(config.session.max_container_messages, 64);
        // Bad values keep the default
        assert_eq!(config.session.ping_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = CourierConfig::load_from_file("/nonexistent/courier.yaml").unwrap();
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("COURIER_LOG_LEVEL", "trace"),
            ("COURIER_PING_INTERVAL", "30s"),
            ("COURIER_LAYER", "158"),
            ("COURIER_EVENT_CAPACITY", "many"),
        ]
        .into_iter()
        .collect();

        let mut config = CourierConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.session.ping_interval, Duration::from_secs(30));
        assert_eq!(config.session.layer, 158);
        assert_eq!(config.session.event_capacity, 64);
    }

    #[test]
    fn test_validate_rejects_oversized_containers() {
        let mut config = CourierConfig::default();
        config.session.max_container_messages = MAX_CONTAINER_MESSAGES + 1;
        assert!(config.validate().is_err());

        config.session.max_container_messages = 8;
        config.session.id_window_capacity = 0;
        assert!(config.validate().is_err());
    }
}
