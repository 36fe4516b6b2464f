// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Longest timeout or grace period accepted (one year).
const MAX_PERIOD_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 9000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Community (broker instance) name
    #[serde(default = "default_community")]
    pub community: String,

    /// Time acceleration factor for playback (1.0 = real time)
    #[serde(default = "default_time_warp")]
    pub time_warp: f64,

    /// Idle time after which a silent client is disconnected (seconds)
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: f64,

    /// Time allowed for a new connection to say hello (seconds)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: f64,

    /// Dispatcher heartbeat (self-variable refresh and async flush) in ms
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Maximum frame size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum number of connected clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Maximum pending messages per client before the oldest is dropped
    #[serde(default = "default_max_held_mail")]
    pub max_held_mail: usize,

    /// Packet rate above which async clients are asked to consolidate (Hz)
    #[serde(default = "default_max_client_packet_rate")]
    pub max_client_packet_rate_hz: f64,

    /// Time granted to sessions to finish before being aborted (ms)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Disable Nagle on client sockets
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9000
}

fn default_community() -> String {
    "#1".to_string()
}

fn default_time_warp() -> f64 {
    1.0
}

fn default_client_timeout() -> f64 {
    5.0
}

fn default_handshake_timeout() -> f64 {
    5.0
}

fn default_heartbeat_interval() -> u64 {
    500
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_max_clients() -> usize {
    1000
}

fn default_max_held_mail() -> usize {
    10_000
}

fn default_max_client_packet_rate() -> f64 {
    100.0
}

fn default_shutdown_grace() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            community: default_community(),
            time_warp: default_time_warp(),
            client_timeout_secs: default_client_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_message_size: default_max_message_size(),
            max_clients: default_max_clients(),
            max_held_mail: default_max_held_mail(),
            max_client_packet_rate_hz: default_max_client_packet_rate(),
            shutdown_grace_ms: default_shutdown_grace(),
            tcp_nodelay: true,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Name the broker writes its own variables under.
    pub fn db_name(&self) -> String {
        format!("VARDB_{}", self.community)
    }

    /// Get client idle timeout as Duration.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.client_timeout_secs)
    }

    /// Get handshake timeout as Duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.handshake_timeout_secs)
    }

    /// Get dispatcher heartbeat as Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get shutdown grace period as Duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Consolidation period offered to clients sending too fast.
    pub fn throttled_consolidation_period(&self) -> f64 {
        1.0 / self.max_client_packet_rate_hz
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.community.is_empty() {
            return Err(ConfigError::InvalidValue("community cannot be empty".into()));
        }
        if !(self.time_warp > 0.0) || !self.time_warp.is_finite() {
            return Err(ConfigError::InvalidValue(
                "time_warp must be positive and finite".into(),
            ));
        }
        check_period("client_timeout_secs", self.client_timeout_secs)?;
        check_period("handshake_timeout_secs", self.handshake_timeout_secs)?;
        check_period("shutdown_grace_ms", self.shutdown_grace_ms as f64 / 1000.0)?;
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_ms cannot be 0".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_message_size cannot be 0".into(),
            ));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::InvalidValue("max_clients cannot be 0".into()));
        }
        if self.max_held_mail == 0 {
            return Err(ConfigError::InvalidValue("max_held_mail cannot be 0".into()));
        }
        if !(self.max_client_packet_rate_hz > 0.0) || !self.max_client_packet_rate_hz.is_finite() {
            return Err(ConfigError::InvalidValue(
                "max_client_packet_rate_hz must be positive and finite".into(),
            ));
        }
        Ok(())
    }
}

/// A period must convert to a `Duration` and stay within `MAX_PERIOD_SECS`.
fn check_period(name: &str, secs: f64) -> Result<(), ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(period) if secs > 0.0 && period.as_secs_f64() <= MAX_PERIOD_SECS => Ok(()),
        _ => Err(ConfigError::InvalidValue(format!(
            "{} must be positive and at most {} seconds",
            name, MAX_PERIOD_SECS
        ))),
    }
}

/// Configuration error types.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 9000);
        assert_eq!(config.community, "#1");
        assert_eq!(config.time_warp, 1.0);
        assert_eq!(config.client_timeout(), Duration::from_secs(5));
        assert_eq!(config.db_name(), "VARDB_#1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: BrokerConfig =
            serde_json::from_str(r#"{"port": 9100, "community": "alpha"}"#).unwrap();
        assert_eq!(parsed.port, 9100);
        assert_eq!(parsed.community, "alpha");
        assert_eq!(parsed.max_held_mail, 10_000);
        assert!(parsed.tcp_nodelay);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");

        let config = BrokerConfig {
            port: 9005,
            time_warp: 4.0,
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.port, 9005);
        assert_eq!(loaded.time_warp, 4.0);
    }

    #[test]
    fn test_missing_file() {
        let err = BrokerConfig::from_file(Path::new("/nonexistent/broker.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_validation_port_zero() {
        let config = BrokerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_non_positive_values() {
        let warp = BrokerConfig {
            time_warp: 0.0,
            ..Default::default()
        };
        assert!(warp.validate().is_err());

        let timeout = BrokerConfig {
            client_timeout_secs: -1.0,
            ..Default::default()
        };
        assert!(timeout.validate().is_err());

        let mail = BrokerConfig {
            max_held_mail: 0,
            ..Default::default()
        };
        assert!(mail.validate().is_err());
    }

    #[test]
    fn test_validation_out_of_range_values() {
        let huge_timeout = BrokerConfig {
            client_timeout_secs: 1e20,
            ..Default::default()
        };
        assert!(huge_timeout.validate().is_err());

        let huge_handshake = BrokerConfig {
            handshake_timeout_secs: 1e20,
            ..Default::default()
        };
        assert!(huge_handshake.validate().is_err());

        let nan_timeout = BrokerConfig {
            client_timeout_secs: f64::NAN,
            ..Default::default()
        };
        assert!(nan_timeout.validate().is_err());

        let infinite_warp = BrokerConfig {
            time_warp: f64::INFINITY,
            ..Default::default()
        };
        assert!(infinite_warp.validate().is_err());

        let huge_grace = BrokerConfig {
            shutdown_grace_ms: u64::MAX,
            ..Default::default()
        };
        assert!(huge_grace.validate().is_err());

        let day = BrokerConfig {
            client_timeout_secs: 86_400.0,
            ..Default::default()
        };
        assert!(day.validate().is_ok());
        assert_eq!(day.client_timeout(), Duration::from_secs(86_400));
    }
}
