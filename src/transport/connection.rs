//! Connection lifecycle over a single [`BrokerLink`]
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                                   |                              ^
//!                                   +------- connection lost ------+
//! ```
//!
//! `connect`, `disconnect` and `update` are serialized by one async mutex.
//! Publish, subscribe and unsubscribe only read the current link and never
//! wait on the lifecycle lock.

use super::options::{ClientConfiguration, PasswordDecryptor, SystemInfo};
use super::persistence::open_store;
use super::{
    BrokerLink, LinkEvent, LinkFactory, Qos, QuiesceScope, SessionIdentity, TransportListener,
    TransportToken,
};
use crate::config::TransportSection;
use crate::error::{CloudError, CloudResult};
use crate::lifecycle_span;
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::protocol::TopicContext;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// State touched by the driver task as well as the connection
struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    session_id: RwLock<String>,
    /// Bumped whenever a link session ends; drivers of older sessions go quiet
    generation: AtomicU64,
    listeners: ListenerRegistry<dyn TransportListener>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn session_id(&self) -> String {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Default)]
struct Lifecycle {
    identity: Option<SessionIdentity>,
    driver: Option<JoinHandle<()>>,
}

pub struct TransportConnection {
    factory: Arc<dyn LinkFactory>,
    system: Arc<dyn SystemInfo>,
    decryptor: Arc<dyn PasswordDecryptor>,
    topic_context: Arc<TopicContext>,
    config: RwLock<Option<ClientConfiguration>>,
    link: RwLock<Option<Arc<dyn BrokerLink>>>,
    lifecycle: Mutex<Lifecycle>,
    shared: Arc<Shared>,
}

impl TransportConnection {
    /// Create a disconnected transport
    ///
    /// An invalid section is logged and leaves the transport unconfigured;
    /// `connect` then fails with `InvalidConfiguration` until `update` succeeds.
    pub fn new(
        section: &TransportSection,
        factory: Arc<dyn LinkFactory>,
        system: Arc<dyn SystemInfo>,
        decryptor: Arc<dyn PasswordDecryptor>,
        topic_context: Arc<TopicContext>,
    ) -> Self {
        let config = match ClientConfiguration::build(section, system.as_ref(), decryptor.as_ref())
        {
            Ok(config) => {
                topic_context.replace(config.topic_variables.clone());
                Some(config)
            }
            Err(e) => {
                error!(error = %e, "Invalid transport configuration");
                None
            }
        };

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            factory,
            system,
            decryptor,
            topic_context,
            config: RwLock::new(config),
            link: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
            shared: Arc::new(Shared {
                state_tx,
                session_id: RwLock::new(String::new()),
                generation: AtomicU64::new(0),
                listeners: ListenerRegistry::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// `clientId-brokerUrl` of the last connected session
    pub fn session_id(&self) -> String {
        self.shared.session_id()
    }

    pub fn broker_url(&self) -> Option<String> {
        self.read_config(|c| c.options.broker_url.clone())
    }

    pub fn client_id(&self) -> Option<String> {
        self.read_config(|c| c.options.client_id.clone())
    }

    pub fn account_name(&self) -> Option<String> {
        self.read_config(|c| c.account_name.clone())
    }

    pub fn topic_context(&self) -> &Arc<TopicContext> {
        &self.topic_context
    }

    /// Per-operation timeout of the current configuration
    pub fn timeout(&self) -> Duration {
        self.read_config(|c| c.timeout())
            .unwrap_or(Duration::from_secs(20))
    }

    fn read_config<T>(&self, f: impl FnOnce(&ClientConfiguration) -> T) -> Option<T> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
    }

    fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_link(&self, link: Option<Arc<dyn BrokerLink>>) -> Option<Arc<dyn BrokerLink>> {
        std::mem::replace(
            &mut *self.link.write().unwrap_or_else(PoisonError::into_inner),
            link,
        )
    }

    /// Connect with the current configuration
    pub async fn connect(&self) -> CloudResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;

        if self.state() != ConnectionState::Disconnected {
            return Err(CloudError::AlreadyConnected);
        }

        let config = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CloudError::invalid_configuration("transport is not configured"))?;

        self.shared.set_state(ConnectionState::Connecting);

        let span = lifecycle_span!(
            operation = "connect",
            broker = %config.options.broker_url,
            client_id = %config.options.client_id
        );

        match self
            .establish(&mut lifecycle, &config)
            .instrument(span)
            .await
        {
            Ok(new_session) => {
                self.shared.set_state(ConnectionState::Connected);
                info!(
                    session_id = %self.session_id(),
                    new_session = new_session,
                    "Connected to broker"
                );
                self.shared
                    .listeners
                    .for_each("connection_established", |l| {
                        l.on_connection_established(new_session)
                    });
                Ok(())
            }
            Err(e) => {
                // A fresh link gets a fresh identity on the next attempt
                if let Some(link) = self.replace_link(None) {
                    link.close();
                }
                lifecycle.identity = None;
                self.shared.set_state(ConnectionState::Disconnected);
                warn!(error = %e, "Connect attempt failed");
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        lifecycle: &mut Lifecycle,
        config: &ClientConfiguration,
    ) -> CloudResult<bool> {
        let identity = config.identity();

        let link = match (lifecycle.identity.as_ref(), self.current_link()) {
            (Some(current), Some(link)) if *current == identity => link,
            _ => {
                if let Some(old) = self.replace_link(None) {
                    debug!("Session identity changed, closing previous link");
                    old.close();
                }
                let store = open_store(
                    config.persistence,
                    &config.persistence_dir,
                    &identity.client_id,
                    &identity.broker_url,
                )?;
                let link = self.factory.create(&identity, store)?;
                self.replace_link(Some(link.clone()));
                lifecycle.identity = Some(identity.clone());
                link
            }
        };

        // Must be decided before the link connects: a clean start wipes the store
        let new_session = config.options.clean_session || link.pending_deliveries() == 0;

        *self
            .shared
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = identity.session_id();
        self.topic_context.replace(config.topic_variables.clone());

        let options = &config.options;
        info!(
            broker_url = %options.broker_url,
            client_id = %options.client_id,
            username = options.username.as_deref().unwrap_or(""),
            password = if options.password.is_some() { "******" } else { "" },
            keep_alive_secs = options.keep_alive.as_secs(),
            timeout_secs = options.timeout.as_secs(),
            clean_session = options.clean_session,
            protocol = %options.protocol,
            persistence = %config.persistence,
            "Connecting"
        );

        let connect_timeout = options.timeout * 3;
        let events = tokio::time::timeout(connect_timeout, link.connect(options))
            .await
            .map_err(|_| CloudError::timeout("broker connection"))??;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(old) = lifecycle.driver.take() {
            old.abort();
        }
        lifecycle.driver = Some(tokio::spawn(drive(
            self.shared.clone(),
            generation,
            events,
        )));

        Ok(new_session)
    }

    /// Orderly disconnect
    ///
    /// Listeners get `on_disconnecting` first and may defer last-gasp work on
    /// the [`QuiesceScope`]; that work and the link's pending deliveries share
    /// the `quiesce` budget.
    pub async fn disconnect(&self, quiesce: Duration) -> CloudResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.disconnect_locked(quiesce)
            .instrument(lifecycle_span!(operation = "disconnect"))
            .await;
        Ok(())
    }

    async fn disconnect_locked(&self, quiesce: Duration) {
        if self.state() != ConnectionState::Connected {
            warn!(state = ?self.state(), "Disconnect requested but transport is not connected");
            return;
        }

        let started = Instant::now();
        self.shared.set_state(ConnectionState::Disconnecting);

        let scope = QuiesceScope::new();
        self.shared
            .listeners
            .for_each("disconnecting", |l| l.on_disconnecting(&scope));

        let deferred = scope.take();
        if !deferred.is_empty()
            && tokio::time::timeout(quiesce, futures::future::join_all(deferred))
                .await
                .is_err()
        {
            warn!(
                quiesce_ms = quiesce.as_millis() as u64,
                "Quiesce timeout elapsed before last-gasp work finished"
            );
        }

        if let Some(link) = self.current_link() {
            let remaining = quiesce.saturating_sub(started.elapsed());
            if let Err(e) = link.disconnect(remaining).await {
                warn!(error = %e, "Link did not disconnect cleanly");
            }
        }

        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Disconnected from broker");

        self.shared
            .listeners
            .for_each("disconnected", |l| l.on_disconnected());
    }

    /// Reconfigure the transport
    ///
    /// A connected transport is disconnected without quiesce first; whoever
    /// listens to `on_configuration_updated` decides whether to reconnect.
    pub async fn update(&self, section: &TransportSection) -> CloudResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let was_connected = self.is_connected();

        self.shared
            .listeners
            .for_each("configuration_updating", |l| {
                l.on_configuration_updating(was_connected)
            });

        if was_connected {
            self.disconnect_locked(Duration::ZERO).await;
        }

        let config = match ClientConfiguration::build(
            section,
            self.system.as_ref(),
            self.decryptor.as_ref(),
        ) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Rejected transport configuration update");
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = None;
                return Err(e);
            }
        };

        self.topic_context.replace(config.topic_variables.clone());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config);
        info!("Transport configuration updated");

        self.shared
            .listeners
            .for_each("configuration_updated", |l| {
                l.on_configuration_updated(was_connected)
            });
        Ok(())
    }

    /// Publish a message; a token is returned only for QoS > 0
    ///
    /// Allowed while disconnecting so last-gasp messages can go out.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> CloudResult<Option<TransportToken>> {
        if !matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            return Err(CloudError::NotConnected);
        }
        let link = self.current_link().ok_or(CloudError::NotConnected)?;

        let topic = self.topic_context.substitute(topic);
        let session_id = self.session_id();

        let message_id = tokio::time::timeout(
            self.timeout(),
            link.publish(&topic, payload, qos, retain),
        )
        .await
        .map_err(|_| CloudError::timeout(format!("publish to {topic}")))??;

        debug!(topic = %topic, message_id = message_id, qos = ?qos, "Published");
        Ok(qos
            .requires_ack()
            .then(|| TransportToken::new(message_id, session_id)))
    }

    pub async fn subscribe(&self, topic: &str, qos: Qos) -> CloudResult<()> {
        let link = self.connected_link()?;
        let topic = self.topic_context.substitute(topic);

        tokio::time::timeout(self.timeout(), link.subscribe(&topic, qos))
            .await
            .map_err(|_| CloudError::timeout(format!("subscribe to {topic}")))??;

        info!(topic = %topic, qos = ?qos, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> CloudResult<()> {
        let link = self.connected_link()?;
        let topic = self.topic_context.substitute(topic);

        tokio::time::timeout(self.timeout(), link.unsubscribe(&topic))
            .await
            .map_err(|_| CloudError::timeout(format!("unsubscribe from {topic}")))??;

        info!(topic = %topic, "Unsubscribed");
        Ok(())
    }

    fn connected_link(&self) -> CloudResult<Arc<dyn BrokerLink>> {
        if !self.is_connected() {
            return Err(CloudError::NotConnected);
        }
        self.current_link().ok_or(CloudError::NotConnected)
    }

    /// Disconnect without quiesce and release the link
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.disconnect_locked(Duration::ZERO).await;

        if let Some(link) = self.replace_link(None) {
            link.close();
        }
        lifecycle.identity = None;
        if let Some(driver) = lifecycle.driver.take() {
            driver.abort();
        }
    }
}

/// Forward link events to listeners until the link's event stream ends
async fn drive(shared: Arc<Shared>, generation: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::MessageArrived {
                topic,
                payload,
                qos,
                retained,
            } => {
                debug!(topic = %topic, bytes = payload.len(), "Message arrived");
                shared.listeners.for_each("message_arrived", |l| {
                    l.on_message_arrived(&topic, &payload, qos, retained)
                });
            }
            LinkEvent::DeliveryComplete { message_id } => {
                let token = TransportToken::new(message_id, shared.session_id());
                shared
                    .listeners
                    .for_each("message_confirmed", |l| l.on_message_confirmed(&token));
            }
            LinkEvent::ConnectionLost { cause } => {
                if shared.generation.load(Ordering::SeqCst) != generation {
                    debug!(cause = %cause, "Ignoring connection loss from a previous session");
                    break;
                }

                // An orderly disconnect in progress owns the state transition
                let lost = shared.state_tx.send_if_modified(|state| {
                    if *state == ConnectionState::Connected {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });

                if lost {
                    shared.generation.fetch_add(1, Ordering::SeqCst);
                    warn!(cause = %cause, "Connection lost");
                    shared
                        .listeners
                        .for_each("connection_lost", |l| l.on_connection_lost(&cause));
                }
                break;
            }
        }
    }
    debug!(generation = generation, "Link event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::testing::mocks::{MockLinkFactory, RecordingTransportListener};
    use crate::transport::options::{NoopDecryptor, StaticSystemInfo};

    fn transport(factory: Arc<MockLinkFactory>) -> TransportConnection {
        let mut section = GatewayConfig::test_config().transport;
        section.timeout_secs = 1;
        TransportConnection::new(
            &section,
            factory,
            Arc::new(StaticSystemInfo::default()),
            Arc::new(NoopDecryptor),
            Arc::new(TopicContext::new()),
        )
    }

    #[tokio::test]
    async fn test_connect_then_connect_again_fails() {
        let factory = Arc::new(MockLinkFactory::new());
        let transport = transport(factory.clone());

        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.session_id(), "gw-test-mqtt://localhost:1883");

        assert!(matches!(
            transport.connect().await,
            Err(CloudError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let transport = transport(Arc::new(MockLinkFactory::new()));

        let result = transport
            .publish("a/b", Bytes::from_static(b"x"), Qos::AtLeastOnce, false)
            .await;

        assert!(matches!(result, Err(CloudError::NotConnected)));
    }

    #[tokio::test]
    async fn test_qos0_publish_returns_no_token() {
        let factory = Arc::new(MockLinkFactory::new());
        let transport = transport(factory.clone());
        transport.connect().await.unwrap();

        let none = transport
            .publish("a", Bytes::new(), Qos::AtMostOnce, false)
            .await
            .unwrap();
        let some = transport
            .publish("a", Bytes::new(), Qos::AtLeastOnce, false)
            .await
            .unwrap();

        assert!(none.is_none());
        assert_eq!(some.unwrap().session_id, transport.session_id());
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected_is_a_no_op() {
        let transport = transport(Arc::new(MockLinkFactory::new()));
        let listener = Arc::new(RecordingTransportListener::default());
        transport.add_listener(listener.clone());

        transport.disconnect(Duration::ZERO).await.unwrap();

        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_link_reused_for_same_identity() {
        let factory = Arc::new(MockLinkFactory::new());
        let transport = transport(factory.clone());

        transport.connect().await.unwrap();
        transport.disconnect(Duration::ZERO).await.unwrap();
        transport.connect().await.unwrap();

        assert_eq!(factory.created(), 1);
    }
}
