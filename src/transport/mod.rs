//! Transport layer: one physical broker connection shared by the gateway
//!
//! [`BrokerLink`] is the seam to the wire protocol. [`TransportConnection`]
//! owns one link, drives its lifecycle and fans link events out to
//! [`TransportListener`]s in registration order.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod connection;
pub mod mqtt;
pub mod options;
pub mod persistence;

pub use connection::{ConnectionState, TransportConnection};
pub use options::{ClientConfiguration, NoopDecryptor, PasswordDecryptor, StaticSystemInfo, SystemInfo};
pub use persistence::{DeliveryStore, PersistenceType};

/// MQTT quality of service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> u8 {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl Qos {
    pub fn requires_ack(self) -> bool {
        self != Qos::AtMostOnce
    }
}

/// Identifies one QoS>0 publish; the id is only unique within its session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportToken {
    pub message_id: u16,
    pub session_id: String,
}

impl TransportToken {
    pub fn new(message_id: u16, session_id: impl Into<String>) -> Self {
        Self {
            message_id,
            session_id: session_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "3.1.1")]
    V311,
    #[default]
    #[serde(rename = "5")]
    V5,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V311 => write!(f, "3.1.1"),
            ProtocolVersion::V5 => write!(f, "5"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// Everything a link needs to open a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub timeout: Duration,
    pub clean_session: bool,
    pub protocol: ProtocolVersion,
    pub last_will: Option<LastWill>,
}

/// Physical identity of a session; a change forces a fresh link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub broker_url: String,
    pub client_id: String,
    pub persistence: PersistenceType,
}

impl SessionIdentity {
    pub fn session_id(&self) -> String {
        format!("{}-{}", self.client_id, self.broker_url)
    }
}

/// Events emitted by a connected link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    MessageArrived {
        topic: String,
        payload: Bytes,
        qos: Qos,
        retained: bool,
    },
    DeliveryComplete {
        message_id: u16,
    },
    ConnectionLost {
        cause: String,
    },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Link is not connected")]
    NotConnected,
    #[error("Too many in-flight messages")]
    TooManyInFlight,
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Unsupported option: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Persistence(#[from] persistence::PersistenceError),
}

/// Opaque connection to the remote broker
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Open the connection; events flow on the returned receiver until it closes
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, LinkError>;

    async fn disconnect(&self, timeout: Duration) -> Result<(), LinkError>;

    /// Resolves once the broker has acknowledged the subscription
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError>;

    /// Hand a message to the broker; the returned id is 0 for QoS 0
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<u16, LinkError>;

    /// Unacknowledged deliveries held by the link's store
    fn pending_deliveries(&self) -> usize;

    /// Release all resources; the link is unusable afterwards
    fn close(&self);
}

/// Creates links for a session identity
pub trait LinkFactory: Send + Sync {
    fn create(
        &self,
        identity: &SessionIdentity,
        store: Arc<dyn DeliveryStore>,
    ) -> Result<Arc<dyn BrokerLink>, LinkError>;
}

/// Work that listeners hand back to the transport during `on_disconnecting`
///
/// The transport awaits all deferred work, bounded by the quiesce timeout,
/// before it closes the link.
#[derive(Default)]
pub struct QuiesceScope {
    deferred: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl QuiesceScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::pin(work));
    }

    pub(crate) fn take(&self) -> Vec<BoxFuture<'static, ()>> {
        std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for QuiesceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("QuiesceScope")
            .field("deferred", &pending)
            .finish()
    }
}

/// Raw transport events; every method defaults to a no-op
///
/// Callbacks run on the transport's driver task and must not block.
#[allow(unused_variables)]
pub trait TransportListener: Send + Sync {
    fn on_configuration_updating(&self, was_connected: bool) {}
    fn on_configuration_updated(&self, was_connected: bool) {}
    fn on_connection_established(&self, new_session: bool) {}
    fn on_disconnecting(&self, scope: &QuiesceScope) {}
    fn on_disconnected(&self) {}
    fn on_connection_lost(&self, cause: &str) {}
    fn on_message_arrived(&self, topic: &str, payload: &[u8], qos: Qos, retained: bool) {}
    fn on_message_confirmed(&self, token: &TransportToken) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversion() {
        assert_eq!(Qos::try_from(0).unwrap(), Qos::AtMostOnce);
        assert_eq!(Qos::try_from(2).unwrap(), Qos::ExactlyOnce);
        assert!(Qos::try_from(3).is_err());
        assert_eq!(u8::from(Qos::AtLeastOnce), 1);
        assert!(!Qos::AtMostOnce.requires_ack());
        assert!(Qos::ExactlyOnce.requires_ack());
    }

    #[test]
    fn test_session_id_combines_client_and_broker() {
        let identity = SessionIdentity {
            broker_url: "mqtt://broker:1883".to_string(),
            client_id: "gw-01".to_string(),
            persistence: PersistenceType::Memory,
        };
        assert_eq!(identity.session_id(), "gw-01-mqtt://broker:1883");
    }

    #[test]
    fn test_tokens_differ_by_session() {
        let a = TransportToken::new(1, "s1");
        let b = TransportToken::new(1, "s2");
        assert_ne!(a, b);
        assert_eq!(a, TransportToken::new(1, "s1"));
    }

    #[tokio::test]
    async fn test_quiesce_scope_collects_deferred_work() {
        let scope = QuiesceScope::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scope.defer(async move {
            let _ = tx.send(42);
        });

        let work = scope.take();
        assert_eq!(work.len(), 1);
        futures::future::join_all(work).await;
        assert_eq!(rx.await.unwrap(), 42);
        assert!(scope.take().is_empty());
    }
}
