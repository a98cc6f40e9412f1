//! Building a validated client configuration from the `[transport]` section

use super::{ConnectOptions, LastWill, PersistenceType, Qos, SessionIdentity};
use crate::config::{SystemSection, TransportSection};
use crate::error::{CloudError, CloudResult};
use crate::protocol::topics::{self, ACCOUNT_NAME_KEY, CLIENT_ID_KEY};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Device facts needed by the transport
pub trait SystemInfo: Send + Sync {
    fn primary_mac_address(&self) -> Option<String>;

    fn model_name(&self) -> Option<String> {
        None
    }
}

/// [`SystemInfo`] backed by fixed values, usually from `[system]`
#[derive(Debug, Clone, Default)]
pub struct StaticSystemInfo {
    pub mac_address: Option<String>,
    pub model_name: Option<String>,
}

impl StaticSystemInfo {
    pub fn new(mac_address: impl Into<String>) -> Self {
        Self {
            mac_address: Some(mac_address.into()),
            model_name: None,
        }
    }
}

impl From<&SystemSection> for StaticSystemInfo {
    fn from(section: &SystemSection) -> Self {
        Self {
            mac_address: section.mac_address.clone(),
            model_name: section.model_name.clone(),
        }
    }
}

impl SystemInfo for StaticSystemInfo {
    fn primary_mac_address(&self) -> Option<String> {
        self.mac_address.clone()
    }

    fn model_name(&self) -> Option<String> {
        self.model_name.clone()
    }
}

#[derive(Debug, Error)]
#[error("Password decryption failed: {0}")]
pub struct DecryptError(pub String);

pub trait PasswordDecryptor: Send + Sync {
    fn decrypt(&self, encrypted: &str) -> Result<String, DecryptError>;
}

/// Decryptor for deployments that store plain passwords
///
/// Always fails, so callers fall back to the configured value as written.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDecryptor;

impl PasswordDecryptor for NoopDecryptor {
    fn decrypt(&self, _encrypted: &str) -> Result<String, DecryptError> {
        Err(DecryptError("no decryptor configured".to_string()))
    }
}

/// Validated, ready-to-connect view of the transport section
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfiguration {
    pub options: ConnectOptions,
    pub account_name: String,
    pub persistence: PersistenceType,
    pub persistence_dir: PathBuf,
    /// Values for `#account-name` and `#client-id`
    pub topic_variables: HashMap<String, String>,
}

impl ClientConfiguration {
    pub fn build(
        section: &TransportSection,
        system: &dyn SystemInfo,
        decryptor: &dyn PasswordDecryptor,
    ) -> CloudResult<Self> {
        let broker_url = normalize_broker_url(&section.broker_url)?;
        let client_id = resolve_client_id(&section.client_id, system)?;

        if section.account_name.trim().is_empty() {
            return Err(CloudError::invalid_configuration("account name is required"));
        }
        if section.keep_alive_secs == 0 {
            return Err(CloudError::invalid_configuration(
                "keep-alive interval must be positive",
            ));
        }
        if section.timeout_secs == 0 {
            return Err(CloudError::invalid_configuration("timeout must be positive"));
        }

        let mut topic_variables = HashMap::new();
        topic_variables.insert(ACCOUNT_NAME_KEY.to_string(), section.account_name.clone());
        topic_variables.insert(CLIENT_ID_KEY.to_string(), client_id.clone());

        let last_will = match section.lwt.topic.as_deref().map(str::trim) {
            Some(topic) if !topic.is_empty() => Some(LastWill {
                topic: topics::substitute(topic, &topic_variables),
                payload: section.lwt.payload.as_bytes().to_vec(),
                qos: Qos::try_from(section.lwt.qos).map_err(CloudError::invalid_configuration)?,
                retain: section.lwt.retain,
            }),
            _ => None,
        };

        let password = section
            .resolve_password()
            .map(|raw| match decryptor.decrypt(&raw) {
                Ok(plain) => plain,
                Err(e) => {
                    // Deliberately permissive: startup continues with the value as written
                    warn!(error = %e, "Using configured password as-is");
                    raw
                }
            });

        let options = ConnectOptions {
            broker_url,
            client_id,
            username: section.username.clone().filter(|u| !u.is_empty()),
            password,
            keep_alive: Duration::from_secs(section.keep_alive_secs),
            timeout: Duration::from_secs(section.timeout_secs),
            clean_session: section.clean_session,
            protocol: section.protocol_version,
            last_will,
        };

        Ok(Self {
            options,
            account_name: section.account_name.clone(),
            persistence: section.persistence,
            persistence_dir: section.persistence_dir.clone(),
            topic_variables,
        })
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            broker_url: self.options.broker_url.clone(),
            client_id: self.options.client_id.clone(),
            persistence: self.persistence,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.options.timeout
    }
}

fn resolve_client_id(configured: &str, system: &dyn SystemInfo) -> CloudResult<String> {
    let raw = match configured.trim() {
        "" => system
            .primary_mac_address()
            .filter(|mac| !mac.trim().is_empty())
            .ok_or_else(|| {
                CloudError::invalid_configuration(
                    "client id is blank and no primary MAC address is available",
                )
            })?,
        id => id.to_string(),
    };
    Ok(topics::sanitize_client_id(raw.trim()))
}

/// Accept `mqtt://`/`mqtts://` (or the `tcp://`/`ssl://` aliases) and strip a trailing `/`
pub fn normalize_broker_url(raw: &str) -> CloudResult<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(CloudError::invalid_configuration("broker URL is required"));
    }

    let url = Url::parse(trimmed).map_err(|e| {
        CloudError::invalid_configuration(format!("malformed broker URL '{trimmed}': {e}"))
    })?;

    let scheme = match url.scheme() {
        "mqtt" | "tcp" => "mqtt",
        "mqtts" | "ssl" => "mqtts",
        other => {
            return Err(CloudError::invalid_configuration(format!(
                "unsupported broker URL scheme '{other}', expected mqtt or mqtts"
            )))
        }
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CloudError::invalid_configuration("broker URL has no host"))?;

    Ok(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}
