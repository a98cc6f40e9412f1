//! Mock implementations for testing
//!
//! Provides an in-memory broker link, recording listeners and a polling
//! helper so the connection, publisher and Cloudlet layers can be tested
//! without a broker.

use crate::cloud::CloudClientListener;
use crate::outbound::{DataServiceListener, MessageId};
use crate::transport::persistence::{DeliveryStore, PersistedDelivery};
use crate::transport::{
    BrokerLink, ConnectOptions, LinkError, LinkEvent, LinkFactory, Qos, QuiesceScope,
    SessionIdentity, TransportListener, TransportToken,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A publish recorded by [`MockBrokerLink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    /// 0 for QoS 0
    pub message_id: u16,
}

/// In-memory broker link
///
/// Unacknowledged QoS>0 publishes go to the delivery store handed over by
/// the factory, exactly like the real link, so session continuity can be
/// tested end to end.
pub struct MockBrokerLink {
    store: Arc<dyn DeliveryStore>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    auto_confirm: AtomicBool,
    unresponsive: AtomicBool,
    connect_failures: AtomicUsize,
    connects: AtomicUsize,
    next_id: AtomicU16,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, Qos)>>,
    unsubscriptions: Mutex<Vec<String>>,
    last_options: Mutex<Option<ConnectOptions>>,
}

impl MockBrokerLink {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            store,
            events: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            auto_confirm: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            connect_failures: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            next_id: AtomicU16::new(0),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            last_options: Mutex::new(None),
        }
    }

    /// Confirm every QoS>0 publish before `publish` returns
    pub fn set_auto_confirm(&self, enabled: bool) {
        self.auto_confirm.store(enabled, Ordering::SeqCst);
    }

    /// Never answer subscribe, unsubscribe or publish
    pub fn set_unresponsive(&self, enabled: bool) {
        self.unresponsive.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `count` connects fail
    pub fn fail_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        lock(&self.last_options).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn published_topics(&self) -> Vec<String> {
        lock(&self.published)
            .iter()
            .map(|p| p.topic.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions)
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        lock(&self.unsubscriptions).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.published).clear();
        lock(&self.subscriptions).clear();
        lock(&self.unsubscriptions).clear();
    }

    fn emit(&self, event: LinkEvent) -> bool {
        lock(&self.events)
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Simulate an inbound message from the broker
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.emit(LinkEvent::MessageArrived {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: Qos::AtLeastOnce,
            retained: false,
        })
    }

    /// Simulate the broker acknowledging one delivery
    pub fn confirm(&self, message_id: u16) -> bool {
        if let Err(e) = self.store.remove(message_id) {
            tracing::warn!(error = %e, "Mock store remove failed");
        }
        self.emit(LinkEvent::DeliveryComplete { message_id })
    }

    /// Acknowledge everything still pending
    pub fn confirm_all(&self) -> usize {
        let pending = self.store.pending().unwrap_or_default();
        pending
            .iter()
            .filter(|delivery| self.confirm(delivery.message_id))
            .count()
    }

    /// Simulate the network dropping the connection
    pub fn drop_connection(&self, cause: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(LinkEvent::ConnectionLost {
            cause: cause.to_string(),
        });
        lock(&self.events).take();
    }

    fn next_message_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    async fn stall_if_unresponsive(&self) {
        if self.unresponsive.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl BrokerLink for MockBrokerLink {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_options) = Some(options.clone());

        let failing = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LinkError::ConnectFailed("mock broker refused".to_string()));
        }

        if options.clean_session {
            self.store.clear()?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.events) = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<(), LinkError> {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.events).take();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.stall_if_unresponsive().await;
        lock(&self.subscriptions).push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.stall_if_unresponsive().await;
        lock(&self.unsubscriptions).push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<u16, LinkError> {
        self.ensure_connected()?;
        self.stall_if_unresponsive().await;

        let message_id = if qos.requires_ack() {
            let id = self.next_message_id();
            self.store.put(PersistedDelivery {
                message_id: id,
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
                retain,
            })?;
            id
        } else {
            0
        };

        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            message_id,
        });

        if message_id != 0 && self.auto_confirm.load(Ordering::SeqCst) {
            self.confirm(message_id);
        }
        Ok(message_id)
    }

    fn pending_deliveries(&self) -> usize {
        self.store.pending_count()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.events).take();
    }
}

/// Factory handing out [`MockBrokerLink`]s
#[derive(Default)]
pub struct MockLinkFactory {
    prepared: Mutex<VecDeque<Arc<MockBrokerLink>>>,
    links: Mutex<Vec<Arc<MockBrokerLink>>>,
    auto_confirm: AtomicBool,
}

impl MockLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links created from now on confirm publishes immediately
    pub fn with_auto_confirm() -> Self {
        let factory = Self::default();
        factory.auto_confirm.store(true, Ordering::SeqCst);
        factory
    }

    /// Queue a pre-configured link for the next `create`
    pub fn prepare(&self, link: Arc<MockBrokerLink>) {
        lock(&self.prepared).push_back(link);
    }

    pub fn created(&self) -> usize {
        lock(&self.links).len()
    }

    pub fn latest(&self) -> Option<Arc<MockBrokerLink>> {
        lock(&self.links).last().cloned()
    }

    /// The most recent link; panics when none was created
    pub fn link(&self) -> Arc<MockBrokerLink> {
        self.latest().expect("no mock link has been created")
    }
}

impl LinkFactory for MockLinkFactory {
    fn create(
        &self,
        _identity: &SessionIdentity,
        store: Arc<dyn DeliveryStore>,
    ) -> Result<Arc<dyn BrokerLink>, LinkError> {
        let link = lock(&self.prepared).pop_front().unwrap_or_else(|| {
            let link = Arc::new(MockBrokerLink::new(store));
            link.set_auto_confirm(self.auto_confirm.load(Ordering::SeqCst));
            link
        });
        lock(&self.links).push(link.clone());
        Ok(link)
    }
}

/// Records transport events as short strings
#[derive(Debug, Default)]
pub struct RecordingTransportListener {
    events: Mutex<Vec<String>>,
}

impl RecordingTransportListener {
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    fn record(&self, event: String) {
        lock(&self.events).push(event);
    }
}

impl TransportListener for RecordingTransportListener {
    fn on_configuration_updating(&self, was_connected: bool) {
        self.record(format!("updating:{was_connected}"));
    }

    fn on_configuration_updated(&self, was_connected: bool) {
        self.record(format!("updated:{was_connected}"));
    }

    fn on_connection_established(&self, new_session: bool) {
        self.record(format!("established:{new_session}"));
    }

    fn on_disconnecting(&self, _scope: &QuiesceScope) {
        self.record("disconnecting".to_string());
    }

    fn on_disconnected(&self) {
        self.record("disconnected".to_string());
    }

    fn on_connection_lost(&self, cause: &str) {
        self.record(format!("lost:{cause}"));
    }

    fn on_message_arrived(&self, topic: &str, _payload: &[u8], _qos: Qos, _retained: bool) {
        self.record(format!("arrived:{topic}"));
    }

    fn on_message_confirmed(&self, token: &TransportToken) {
        self.record(format!("confirmed:{}", token.message_id));
    }
}

/// Records publisher events as short strings
#[derive(Debug, Default)]
pub struct RecordingDataListener {
    events: Mutex<Vec<String>>,
}

impl RecordingDataListener {
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn published(&self) -> Vec<MessageId> {
        self.ids_with_prefix("published:")
    }

    pub fn confirmed(&self) -> Vec<MessageId> {
        self.ids_with_prefix("confirmed:")
    }

    fn ids_with_prefix(&self, prefix: &str) -> Vec<MessageId> {
        lock(&self.events)
            .iter()
            .filter_map(|e| e.strip_prefix(prefix))
            .filter_map(|rest| rest.split(':').next())
            .filter_map(|id| id.parse().ok())
            .collect()
    }

    fn record(&self, event: String) {
        lock(&self.events).push(event);
    }
}

impl DataServiceListener for RecordingDataListener {
    fn on_connection_established(&self, new_session: bool) {
        self.record(format!("established:{new_session}"));
    }

    fn on_disconnecting(&self, _scope: &QuiesceScope) {
        self.record("disconnecting".to_string());
    }

    fn on_disconnected(&self) {
        self.record("disconnected".to_string());
    }

    fn on_connection_lost(&self, cause: &str) {
        self.record(format!("lost:{cause}"));
    }

    fn on_message_arrived(&self, topic: &str, _payload: &[u8], _qos: Qos, _retained: bool) {
        self.record(format!("arrived:{topic}"));
    }

    fn on_message_published(&self, id: MessageId, topic: &str) {
        self.record(format!("published:{id}:{topic}"));
    }

    fn on_message_confirmed(&self, id: MessageId, topic: &str) {
        self.record(format!("confirmed:{id}:{topic}"));
    }
}

/// A message seen by [`RecordingCloudListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub device_id: String,
    pub app_topic: String,
    pub payload: Vec<u8>,
    pub control: bool,
}

/// Records CloudClient callbacks
#[derive(Debug, Default)]
pub struct RecordingCloudListener {
    messages: Mutex<Vec<ReceivedMessage>>,
    events: Mutex<Vec<String>>,
}

impl RecordingCloudListener {
    pub fn messages(&self) -> Vec<ReceivedMessage> {
        lock(&self.messages).clone()
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    fn record(&self, event: String) {
        lock(&self.events).push(event);
    }

    fn receive(&self, device_id: &str, app_topic: &str, payload: &[u8], control: bool) {
        lock(&self.messages).push(ReceivedMessage {
            device_id: device_id.to_string(),
            app_topic: app_topic.to_string(),
            payload: payload.to_vec(),
            control,
        });
    }
}

impl CloudClientListener for RecordingCloudListener {
    fn on_message_arrived(&self, device_id: &str, app_topic: &str, payload: &[u8], _qos: Qos, _retained: bool) {
        self.receive(device_id, app_topic, payload, false);
    }

    fn on_control_message_arrived(
        &self,
        device_id: &str,
        app_topic: &str,
        payload: &[u8],
        _qos: Qos,
        _retained: bool,
    ) {
        self.receive(device_id, app_topic, payload, true);
    }

    fn on_connection_established(&self) {
        self.record("established".to_string());
    }

    fn on_connection_lost(&self) {
        self.record("lost".to_string());
    }

    fn on_message_published(&self, id: MessageId, app_topic: &str) {
        self.record(format!("published:{id}:{app_topic}"));
    }

    fn on_message_confirmed(&self, id: MessageId, app_topic: &str) {
        self.record(format!("confirmed:{id}:{app_topic}"));
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`eventually`] for async conditions
pub async fn eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
