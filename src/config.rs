//! Gateway configuration loaded from TOML
//!
//! ```toml
//! [transport]
//! broker_url = "mqtts://broker.example.com:8883"
//! account_name = "acme"
//! persistence = "file"
//!
//! [transport.lwt]
//! topic = "$EDC/#account-name/#client-id/MQTT/LWT"
//!
//! [data]
//! in_flight_policy = "republish"
//! ```
//!
//! `in_flight_policy` has no default: what happens to unconfirmed messages
//! after a session reset must be chosen explicitly.

use crate::outbound::InFlightPolicy;
use crate::transport::{PasswordDecryptor, PersistenceType, ProtocolVersion};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub transport: TransportSection,
    pub data: DataSection,
    #[serde(default)]
    pub cloud: CloudSection,
    #[serde(default)]
    pub cloudlet: CloudletSection,
    #[serde(default)]
    pub system: SystemSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    /// Account segment of every topic
    pub account_name: String,
    /// Blank means derive from the primary MAC address
    #[serde(default)]
    pub client_id: String,
    pub username: Option<String>,
    /// Possibly encrypted; see [`PasswordDecryptor`]
    pub password: Option<String>,
    /// Environment variable holding the password, used when `password` is unset
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Governs subscribe, unsubscribe and publish; connect waits three times as long
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub persistence: PersistenceType,
    #[serde(default = "default_persistence_dir")]
    pub persistence_dir: PathBuf,
    #[serde(default)]
    pub lwt: LwtSection,
}

/// Last-Will settings; no topic means no will
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LwtSection {
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Publisher, reconnect and store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSection {
    /// What to do with unconfirmed messages after a session reset
    pub in_flight_policy: InFlightPolicy,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Delays tried before falling back to `retry_interval_secs`
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_secs: Vec<u64>,
    #[serde(default = "default_quiesce_timeout")]
    pub quiesce_timeout_secs: u64,
    /// Cap on held messages with priority >= 2
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,
    #[serde(default = "default_purge_age")]
    pub purge_age_secs: u64,
    #[serde(default = "default_housekeeper_interval")]
    pub housekeeper_interval_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// 0 disables the congestion watchdog
    #[serde(default)]
    pub congestion_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudSection {
    #[serde(default = "default_control_prefix")]
    pub control_prefix: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub lifecycle_qos: u8,
    #[serde(default)]
    pub lifecycle_retain: bool,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            control_prefix: default_control_prefix(),
            display_name: default_display_name(),
            lifecycle_qos: 0,
            lifecycle_retain: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudletSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded job queue in front of the workers
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for CloudletSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Static device facts, used when no platform lookup is available
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemSection {
    pub mac_address: Option<String>,
    pub model_name: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    30
}

fn default_timeout() -> u64 {
    20
}

fn default_persistence_dir() -> PathBuf {
    PathBuf::from("/var/lib/gateway-cloud")
}

fn default_retry_interval() -> u64 {
    60
}

fn default_backoff() -> Vec<u64> {
    vec![1, 2, 5, 10, 30]
}

fn default_quiesce_timeout() -> u64 {
    10
}

fn default_store_capacity() -> usize {
    10_000
}

fn default_purge_age() -> u64 {
    60
}

fn default_housekeeper_interval() -> u64 {
    900
}

fn default_max_in_flight() -> usize {
    9
}

fn default_control_prefix() -> String {
    crate::protocol::DEFAULT_CONTROL_PREFIX.to_string()
}

fn default_display_name() -> String {
    "gateway".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_queue_depth() -> usize {
    64
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Like [`load_from_file`](Self::load_from_file), decrypting the password once
    ///
    /// A password that fails to decrypt is kept as written.
    pub fn load_from_file_with(
        path: &Path,
        decryptor: &dyn PasswordDecryptor,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        if let Some(password) = config.transport.password.take() {
            config.transport.password = Some(decryptor.decrypt(&password).unwrap_or(password));
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        self.data.validate()?;

        if !self.cloud.control_prefix.starts_with('$') {
            return Err(ConfigError::InvalidConfig(format!(
                "control_prefix '{}' must start with '$'",
                self.cloud.control_prefix
            )));
        }
        if self.cloud.lifecycle_qos > 2 {
            return Err(ConfigError::InvalidConfig(
                "lifecycle_qos must be 0, 1 or 2".to_string(),
            ));
        }
        if self.cloudlet.workers == 0 || self.cloudlet.queue_depth == 0 {
            return Err(ConfigError::InvalidConfig(
                "cloudlet workers and queue_depth must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[transport]
broker_url = "mqtt://localhost:1883"
account_name = "acct"
client_id = "gw-test"

[data]
in_flight_policy = "republish"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl TransportSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker_url is required".to_string(),
            ));
        }
        if self.account_name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "account_name is required".to_string(),
            ));
        }
        if self.keep_alive_secs == 0 || self.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs and timeout_secs must be positive".to_string(),
            ));
        }
        if self.lwt.qos > 2 {
            return Err(ConfigError::InvalidConfig(
                "lwt.qos must be 0, 1 or 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Password from the file, else from `password_env`
    pub fn resolve_password(&self) -> Option<String> {
        self.password.clone().or_else(|| {
            self.password_env
                .as_ref()
                .and_then(|name| std::env::var(name).ok())
        })
    }
}

impl DataSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_in_flight must be positive".to_string(),
            ));
        }
        if self.retry_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry_interval_secs must be positive".to_string(),
            ));
        }
        if self.housekeeper_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "housekeeper_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
