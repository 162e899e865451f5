//! Relay configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `GEORELAY_*` environment variables (plus `PORT`), then CLI flags applied
//! by the binary. Every threshold the components use lives here; nothing
//! downstream hardcodes business constants.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What happens when a client registers with an id that is already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Close the previous connection and let the new one take the id.
    Replace,
    /// Refuse the new registration and close the new connection.
    Reject,
}

/// How a group's reference point for admitting members is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPolicy {
    /// The first member's position at group creation, never updated.
    Fixed,
    /// The current first member's latest reported position.
    Leader,
}

/// Configuration for the relay daemon.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8080`; `0` auto-assigns).
    pub port: u16,
    /// Max distance between a driver-candidate and a group anchor to join it.
    pub proximity_threshold_m: f64,
    /// Max distance between sender and recipient for a location relay.
    pub broadcast_radius_m: f64,
    /// Members per group.
    pub group_capacity: usize,
    /// Concurrently live groups.
    pub max_groups: usize,
    /// Concurrently admitted connections.
    pub max_clients: usize,
    /// Liveness tick interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Evict a connection after this long without an acknowledgment.
    pub heartbeat_timeout_secs: u64,
    /// Max inbound text frame size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue length.
    pub outbound_buffer: usize,
    /// A frame that cannot be written within this many seconds ends the connection.
    pub write_timeout_secs: u64,
    pub duplicate_policy: DuplicatePolicy,
    pub anchor_policy: AnchorPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            proximity_threshold_m: 1.3,
            broadcast_radius_m: 750.0,
            group_capacity: 3,
            max_groups: 100,
            max_clients: 700,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            max_message_size: 64 * 1024,
            outbound_buffer: 64,
            write_timeout_secs: 10,
            duplicate_policy: DuplicatePolicy::Replace,
            anchor_policy: AnchorPolicy::Fixed,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from an optional TOML file and the process environment.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Read` if the file cannot be read
    /// - `ConfigError::Parse` if the file is not valid TOML for this struct
    /// - `ConfigError::Env` if an environment override cannot be parsed
    /// - `ConfigError::Invalid` if the result fails validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    /// Parses a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Applies environment overrides through `lookup`.
    ///
    /// `PORT` is honoured for compatibility with hosting platforms;
    /// `GEORELAY_PORT` wins when both are set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("GEORELAY_HOST") {
            self.host = host;
        }
        override_parsed(&lookup, "PORT", &mut self.port)?;
        override_parsed(&lookup, "GEORELAY_PORT", &mut self.port)?;
        override_parsed(&lookup, "GEORELAY_PROXIMITY_THRESHOLD_M", &mut self.proximity_threshold_m)?;
        override_parsed(&lookup, "GEORELAY_BROADCAST_RADIUS_M", &mut self.broadcast_radius_m)?;
        override_parsed(&lookup, "GEORELAY_GROUP_CAPACITY", &mut self.group_capacity)?;
        override_parsed(&lookup, "GEORELAY_MAX_GROUPS", &mut self.max_groups)?;
        override_parsed(&lookup, "GEORELAY_MAX_CLIENTS", &mut self.max_clients)?;
        override_parsed(&lookup, "GEORELAY_HEARTBEAT_INTERVAL_SECS", &mut self.heartbeat_interval_secs)?;
        override_parsed(&lookup, "GEORELAY_HEARTBEAT_TIMEOUT_SECS", &mut self.heartbeat_timeout_secs)?;
        override_parsed(&lookup, "GEORELAY_MAX_MESSAGE_SIZE", &mut self.max_message_size)?;

        if let Some(value) = lookup("GEORELAY_DUPLICATE_POLICY") {
            self.duplicate_policy = match value.as_str() {
                "replace" => DuplicatePolicy::Replace,
                "reject" => DuplicatePolicy::Reject,
                _ => return Err(ConfigError::env("GEORELAY_DUPLICATE_POLICY", &value)),
            };
        }
        if let Some(value) = lookup("GEORELAY_ANCHOR_POLICY") {
            self.anchor_policy = match value.as_str() {
                "fixed" => AnchorPolicy::Fixed,
                "leader" => AnchorPolicy::Leader,
                _ => return Err(ConfigError::env("GEORELAY_ANCHOR_POLICY", &value)),
            };
        }
        Ok(())
    }

    /// Checks that the values can run a relay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.proximity_threshold_m.is_finite() && self.proximity_threshold_m >= 0.0) {
            return Err(ConfigError::invalid("proximity_threshold_m must be >= 0"));
        }
        if !(self.broadcast_radius_m.is_finite() && self.broadcast_radius_m >= 0.0) {
            return Err(ConfigError::invalid("broadcast_radius_m must be >= 0"));
        }
        if self.group_capacity == 0 {
            return Err(ConfigError::invalid("group_capacity must be at least 1"));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::invalid("max_clients must be at least 1"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid("heartbeat_interval_secs must be at least 1"));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::invalid(
                "heartbeat_timeout_secs must not be shorter than heartbeat_interval_secs",
            ));
        }
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::invalid("write_timeout_secs must be at least 1"));
        }
        if self.max_message_size == 0 || self.outbound_buffer == 0 {
            return Err(ConfigError::invalid(
                "max_message_size and outbound_buffer must be positive",
            ));
        }
        Ok(())
    }

    /// Address to bind, as `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::env(key, &value))?;
    }
    Ok(())
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: String, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {value:?}")]
    Env { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn env(key: &str, value: &str) -> Self {
        Self::Env {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn invalid(reason: &str) -> Self {
        Self::Invalid(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.proximity_threshold_m, 1.3);
        assert_eq!(cfg.broadcast_radius_m, 750.0);
        assert_eq!(cfg.group_capacity, 3);
        assert_eq!(cfg.max_groups, 100);
        assert_eq!(cfg.max_clients, 700);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.duplicate_policy, DuplicatePolicy::Replace);
        assert_eq!(cfg.anchor_policy, AnchorPolicy::Fixed);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = RelayConfig::from_toml(
            r#"
            port = 9000
            max_groups = 5
            anchor_policy = "leader"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_groups, 5);
        assert_eq!(cfg.anchor_policy, AnchorPolicy::Leader);
        assert_eq!(cfg.max_clients, 700);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "host = \"127.0.0.1\"\nduplicate_policy = \"reject\"\n").unwrap();

        let cfg = RelayConfig::from_file(&path).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.duplicate_policy, DuplicatePolicy::Reject);

        let missing = RelayConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_bad_toml() {
        let err = RelayConfig::from_toml("port = \"eighty\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = RelayConfig::default();
        let rendered = cfg.to_toml().unwrap();
        assert!(rendered.contains("duplicate_policy = \"replace\""));
        assert_eq!(RelayConfig::from_toml(&rendered).unwrap(), cfg);
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = RelayConfig::default();
        cfg.apply_env(lookup_from(&[
            ("PORT", "3000"),
            ("GEORELAY_MAX_CLIENTS", "25"),
            ("GEORELAY_BROADCAST_RADIUS_M", "1500.5"),
            ("GEORELAY_DUPLICATE_POLICY", "reject"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.max_clients, 25);
        assert_eq!(cfg.broadcast_radius_m, 1500.5);
        assert_eq!(cfg.duplicate_policy, DuplicatePolicy::Reject);
    }

    #[test]
    fn test_georelay_port_wins_over_port() {
        let mut cfg = RelayConfig::default();
        cfg.apply_env(lookup_from(&[("PORT", "3000"), ("GEORELAY_PORT", "4000")]))
            .unwrap();
        assert_eq!(cfg.port, 4000);
    }

    #[test]
    fn test_bad_env_value() {
        let mut cfg = RelayConfig::default();
        let err = cfg
            .apply_env(lookup_from(&[("GEORELAY_MAX_GROUPS", "lots")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for GEORELAY_MAX_GROUPS: \"lots\""
        );

        let err = cfg
            .apply_env(lookup_from(&[("GEORELAY_ANCHOR_POLICY", "floating")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validation() {
        let cfg = RelayConfig {
            group_capacity: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let cfg = RelayConfig {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = RelayConfig {
            write_timeout_secs: 0,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = RelayConfig {
            broadcast_radius_m: f64::NAN,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bind_addr() {
        let cfg = RelayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..RelayConfig::default()
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }
}
