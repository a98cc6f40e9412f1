//! Publisher service: drains the outbound queue into the transport
//!
//! The DataService is the only [`TransportListener`] the rest of the stack
//! needs. It turns transport tokens back into [`MessageId`]s, keeps the
//! in-flight window bounded and owns the background tasks:
//!
//! - the publisher, woken whenever there may be work;
//! - the reconnect supervisor, started on `start`, after a connection loss
//!   and after a configuration update;
//! - the congestion watchdog, forcing a reconnect when the in-flight window
//!   stays full for too long;
//! - the housekeeper, purging old dropped records.

use super::queue::{Message, MessageId, NextMessage, OutboundQueue, Publication};
use super::reconnect::ReconnectPolicy;
use crate::config::DataSection;
use crate::error::{CloudError, CloudResult};
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::transport::{
    ConnectionState, Qos, QuiesceScope, TransportConnection, TransportListener, TransportToken,
};
use bytes::Bytes;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before retrying after the transport rejected a publish
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(1);

const MIN_WATCHDOG_TICK: Duration = Duration::from_millis(100);

/// Publisher events; every method defaults to a no-op
///
/// Callbacks run on the transport's driver task or the publisher task and
/// must not block.
#[allow(unused_variables)]
pub trait DataServiceListener: Send + Sync {
    fn on_connection_established(&self, new_session: bool) {}
    /// Runs before the queue is flushed; publishing here still goes out
    fn on_disconnecting(&self, scope: &QuiesceScope) {}
    fn on_disconnected(&self) {}
    fn on_connection_lost(&self, cause: &str) {}
    fn on_message_arrived(&self, topic: &str, payload: &[u8], qos: Qos, retained: bool) {}
    fn on_message_published(&self, id: MessageId, topic: &str) {}
    fn on_message_confirmed(&self, id: MessageId, topic: &str) {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    transport: Arc<TransportConnection>,
    queue: OutboundQueue,
    settings: DataSection,
    reconnect: ReconnectPolicy,
    listeners: ListenerRegistry<dyn DataServiceListener>,
    /// Publisher wake-up; permits are kept when nobody is waiting
    wake: Notify,
    /// Signalled after every publisher pass
    idle: Notify,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    congested_since: Mutex<Option<Instant>>,
}

impl Inner {
    fn set_congested(&self, congested: bool) {
        let mut since = lock(&self.congested_since);
        match (congested, since.is_some()) {
            (true, false) => {
                debug!(
                    in_flight = self.queue.in_flight_len(),
                    "In-flight window full"
                );
                *since = Some(Instant::now());
            }
            (false, true) => *since = None,
            _ => {}
        }
    }

    /// Publish until the queue is empty or congested; false if a publish failed
    async fn drain(&self) -> bool {
        loop {
            if !matches!(
                self.transport.state(),
                ConnectionState::Connected | ConnectionState::Disconnecting
            ) {
                return true;
            }
            // Wait for begin_session; connection_established wakes us again
            if self.queue.session_id() != self.transport.session_id() {
                return true;
            }

            let message = match self.queue.next_unpublished(self.settings.max_in_flight) {
                NextMessage::Empty => {
                    self.set_congested(false);
                    return true;
                }
                NextMessage::Congested => {
                    self.set_congested(true);
                    return true;
                }
                NextMessage::Ready(message) => message,
            };
            self.set_congested(false);

            self.queue.begin_publish(message.id);
            let published = self
                .transport
                .publish(
                    message.topic(),
                    message.message.payload.clone(),
                    message.message.qos,
                    message.message.retain,
                )
                .await;

            match published {
                Ok(token) => self.record_publication(message.id, message.topic(), token),
                Err(e) => {
                    self.queue.abandon_publish(message.id);
                    warn!(
                        message_id = message.id,
                        topic = %message.topic(),
                        error = %e,
                        "Publish failed, message stays queued"
                    );
                    return false;
                }
            }
        }
    }

    fn record_publication(&self, id: MessageId, topic: &str, token: Option<TransportToken>) {
        match self.queue.mark_published(id, token) {
            Ok(Publication::Sent | Publication::InFlight) => {
                self.listeners
                    .for_each("message_published", |l| l.on_message_published(id, topic));
            }
            Ok(Publication::Confirmed) => {
                self.listeners
                    .for_each("message_published", |l| l.on_message_published(id, topic));
                self.listeners
                    .for_each("message_confirmed", |l| l.on_message_confirmed(id, topic));
            }
            Ok(Publication::Requeued) => {}
            Err(e) => error!(message_id = id, error = %e, "Failed to record publication"),
        }
    }

    /// Start the reconnect supervisor unless one is already running
    fn schedule_reconnect(self: &Arc<Self>, immediate: bool) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let mut slot = lock(&self.supervisor);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(supervise(
            self.clone(),
            immediate,
            self.shutdown.subscribe(),
        )));
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }
}

async fn run_publisher(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut retry = false;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(PUBLISH_RETRY_DELAY), if retry => {}
        }

        retry = !inner.drain().await;
        inner.idle.notify_waiters();
    }
    debug!("Publisher stopped");
}

async fn supervise(inner: Arc<Inner>, immediate: bool, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        if !immediate || attempt > 0 {
            let delay = inner
                .reconnect
                .delay(if immediate { attempt } else { attempt + 1 });
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        attempt += 1;

        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        match inner.transport.state() {
            ConnectionState::Connected => return,
            ConnectionState::Disconnected => {}
            // Someone else is mid-transition; look again after the next delay
            ConnectionState::Connecting | ConnectionState::Disconnecting => continue,
        }

        info!(attempt = attempt, "Connecting to broker");
        match inner.transport.connect().await {
            Ok(()) => return,
            Err(CloudError::AlreadyConnected) => continue,
            Err(e) => warn!(attempt = attempt, error = %e, "Connect attempt failed, will retry"),
        }
    }
}

async fn run_congestion_watchdog(
    inner: Arc<Inner>,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval((timeout / 4).max(MIN_WATCHDOG_TICK));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let stuck = lock(&inner.congested_since).is_some_and(|since| since.elapsed() >= timeout);
        if !stuck || !inner.transport.is_connected() {
            continue;
        }

        warn!(
            timeout_secs = timeout.as_secs(),
            in_flight = inner.queue.in_flight_len(),
            "In-flight window stuck, forcing reconnect"
        );
        inner.set_congested(false);
        if let Err(e) = inner.transport.disconnect(Duration::ZERO).await {
            warn!(error = %e, "Forced disconnect failed");
        }
        inner.schedule_reconnect(true);
    }
}

async fn run_housekeeper(
    inner: Arc<Inner>,
    interval: Duration,
    purge_age: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // First tick completes immediately, skip it

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let purged = inner.queue.purge_dropped(purge_age);
        if purged > 0 {
            info!(purged = purged, "Purged dropped message records");
        }
    }
}

/// Wait until nothing unpublished is left; bounded by the caller's quiesce
async fn flush(inner: Arc<Inner>) {
    inner.wake.notify_one();
    loop {
        let idle = inner.idle.notified();
        tokio::pin!(idle);
        idle.as_mut().enable();

        if inner.queue.unpublished_len() == 0 {
            return;
        }
        idle.await;
    }
}

/// Transport events routed into the DataService
struct TransportBridge(Weak<Inner>);

impl TransportListener for TransportBridge {
    fn on_configuration_updated(&self, was_connected: bool) {
        let Some(inner) = self.0.upgrade() else { return };
        if was_connected || inner.settings.auto_connect {
            inner.schedule_reconnect(true);
        }
    }

    fn on_connection_established(&self, new_session: bool) {
        let Some(inner) = self.0.upgrade() else { return };

        inner.queue.begin_session(
            &inner.transport.session_id(),
            new_session,
            inner.settings.in_flight_policy,
        );
        inner.listeners.for_each("connection_established", |l| {
            l.on_connection_established(new_session)
        });
        inner.wake.notify_one();
    }

    fn on_disconnecting(&self, scope: &QuiesceScope) {
        let Some(inner) = self.0.upgrade() else { return };

        // Listeners go first so their last-gasp messages are part of the flush
        inner
            .listeners
            .for_each("disconnecting", |l| l.on_disconnecting(scope));
        scope.defer(flush(inner));
    }

    fn on_disconnected(&self) {
        let Some(inner) = self.0.upgrade() else { return };
        inner.set_congested(false);
        inner.listeners.for_each("disconnected", |l| l.on_disconnected());
    }

    fn on_connection_lost(&self, cause: &str) {
        let Some(inner) = self.0.upgrade() else { return };
        inner.set_congested(false);
        inner
            .listeners
            .for_each("connection_lost", |l| l.on_connection_lost(cause));
        inner.schedule_reconnect(false);
    }

    fn on_message_arrived(&self, topic: &str, payload: &[u8], qos: Qos, retained: bool) {
        let Some(inner) = self.0.upgrade() else { return };
        inner.listeners.for_each("message_arrived", |l| {
            l.on_message_arrived(topic, payload, qos, retained)
        });
    }

    fn on_message_confirmed(&self, token: &TransportToken) {
        let Some(inner) = self.0.upgrade() else { return };

        match inner.queue.confirm(token) {
            Ok(Some(message)) => {
                debug!(message_id = message.id, "Delivery confirmed");
                inner.listeners.for_each("message_confirmed", |l| {
                    l.on_message_confirmed(message.id, message.topic())
                });
                inner.wake.notify_one();
            }
            Ok(None) => debug!(
                transport_message_id = token.message_id,
                "Confirmation for an unknown or not yet recorded publish"
            ),
            Err(e) => warn!(error = %e, "Ignoring confirmation"),
        }
    }
}

/// Queue-backed publisher on top of one [`TransportConnection`]
pub struct DataService {
    inner: Arc<Inner>,
    bridge_id: ListenerId,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataService {
    pub fn new(section: &DataSection, transport: Arc<TransportConnection>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            transport: transport.clone(),
            queue: OutboundQueue::new(section.store_capacity),
            settings: section.clone(),
            reconnect: ReconnectPolicy::from(section),
            listeners: ListenerRegistry::new(),
            wake: Notify::new(),
            idle: Notify::new(),
            running: AtomicBool::new(false),
            shutdown,
            supervisor: Mutex::new(None),
            congested_since: Mutex::new(None),
        });

        let bridge_id = transport.add_listener(Arc::new(TransportBridge(Arc::downgrade(&inner))));

        Self {
            inner,
            bridge_id,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn DataServiceListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    /// Returns once any in-progress callback on this listener has finished
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn transport(&self) -> &Arc<TransportConnection> {
        &self.inner.transport
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_secs(self.inner.settings.quiesce_timeout_secs)
    }

    /// Spawn the background tasks; connects right away when `auto_connect` is set
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Data service already started");
            return;
        }
        self.inner.shutdown.send_replace(false);

        let settings = &self.inner.settings;
        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(run_publisher(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(run_housekeeper(
            self.inner.clone(),
            Duration::from_secs(settings.housekeeper_interval_secs),
            Duration::from_secs(settings.purge_age_secs),
            self.inner.shutdown.subscribe(),
        )));
        if settings.congestion_timeout_secs > 0 {
            tasks.push(tokio::spawn(run_congestion_watchdog(
                self.inner.clone(),
                Duration::from_secs(settings.congestion_timeout_secs),
                self.inner.shutdown.subscribe(),
            )));
        }
        drop(tasks);

        info!(
            auto_connect = settings.auto_connect,
            in_flight_policy = ?settings.in_flight_policy,
            max_in_flight = settings.max_in_flight,
            capacity = settings.store_capacity,
            "Data service started"
        );

        // Anything queued before start goes out on the first connection
        self.inner.wake.notify_one();
        if settings.auto_connect {
            self.inner.schedule_reconnect(true);
        }
    }

    /// Disconnect with the configured quiesce and stop the background tasks
    pub async fn stop(&self) -> CloudResult<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel_reconnect();

        // The publisher must outlive the disconnect to flush the queue
        let result = self.inner.transport.disconnect(self.quiesce_timeout()).await;

        self.inner.shutdown.send_replace(true);
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Data service task ended abnormally");
            }
        }

        info!("Data service stopped");
        result
    }

    pub async fn connect(&self) -> CloudResult<()> {
        self.inner.transport.connect().await
    }

    /// Orderly disconnect; no reconnect is scheduled afterwards
    pub async fn disconnect(&self, quiesce: Duration) -> CloudResult<()> {
        self.inner.cancel_reconnect();
        self.inner.transport.disconnect(quiesce).await
    }

    /// Queue a message and wake the publisher
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> CloudResult<MessageId> {
        let id = self
            .inner
            .queue
            .enqueue(Message::new(topic, payload, qos, retain, priority))?;
        self.inner.wake.notify_one();
        Ok(id)
    }

    pub async fn subscribe(&self, topic: &str, qos: Qos) -> CloudResult<()> {
        self.inner.transport.subscribe(topic, qos).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> CloudResult<()> {
        self.inner.transport.unsubscribe(topic).await
    }

    /// Unpublished message ids whose topic matches `pattern`
    pub fn unpublished_message_ids(&self, pattern: &Regex) -> Vec<MessageId> {
        self.inner
            .queue
            .list_unpublished()
            .into_iter()
            .filter(|m| pattern.is_match(m.topic()))
            .map(|m| m.id)
            .collect()
    }

    pub fn in_flight_message_ids(&self, pattern: &Regex) -> Vec<MessageId> {
        self.inner
            .queue
            .list_in_flight()
            .into_iter()
            .filter(|e| pattern.is_match(e.message.topic()))
            .map(|e| e.message.id)
            .collect()
    }

    pub fn dropped_in_flight_message_ids(&self, pattern: &Regex) -> Vec<MessageId> {
        self.inner
            .queue
            .list_dropped()
            .into_iter()
            .filter(|d| pattern.is_match(d.message.topic()))
            .map(|d| d.message.id)
            .collect()
    }
}

impl Drop for DataService {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        self.inner.shutdown.send_replace(true);
        self.inner.transport.remove_listener(self.bridge_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::outbound::InFlightPolicy;
    use crate::protocol::TopicContext;
    use crate::testing::mocks::{eventually, MockLinkFactory, RecordingDataListener};
    use crate::transport::{NoopDecryptor, StaticSystemInfo};

    const WAIT: Duration = Duration::from_secs(2);

    fn service_with(
        factory: Arc<MockLinkFactory>,
        configure: impl FnOnce(&mut GatewayConfig),
    ) -> DataService {
        let mut config = GatewayConfig::test_config();
        config.data.auto_connect = false;
        configure(&mut config);

        let transport = Arc::new(TransportConnection::new(
            &config.transport,
            factory,
            Arc::new(StaticSystemInfo::default()),
            Arc::new(NoopDecryptor),
            Arc::new(TopicContext::new()),
        ));
        DataService::new(&config.data, transport)
    }

    #[tokio::test]
    async fn test_queued_messages_drain_on_connect() {
        let factory = Arc::new(MockLinkFactory::with_auto_confirm());
        let service = service_with(factory.clone(), |_| {});
        let listener = Arc::new(RecordingDataListener::default());
        service.add_listener(listener.clone());
        service.start();

        let id = service
            .publish("acct/gw-test/APP/data", Bytes::from_static(b"1"), Qos::AtLeastOnce, false, 5)
            .unwrap();
        service.connect().await.unwrap();

        assert!(eventually(WAIT, || listener.confirmed() == vec![id]).await);
        assert_eq!(listener.published(), vec![id]);
        assert!(service.queue().is_idle());
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_window_limits_publishing() {
        let factory = Arc::new(MockLinkFactory::new());
        let service = service_with(factory.clone(), |c| c.data.max_in_flight = 1);
        service.start();
        service.connect().await.unwrap();

        service.publish("a", Bytes::new(), Qos::AtLeastOnce, false, 5).unwrap();
        service.publish("b", Bytes::new(), Qos::AtLeastOnce, false, 5).unwrap();

        let link = factory.link();
        assert!(eventually(WAIT, || link.published().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.published().len(), 1);

        link.confirm(link.published()[0].message_id);
        assert!(eventually(WAIT, || link.published().len() == 2).await);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_policy_on_new_session() {
        let factory = Arc::new(MockLinkFactory::new());
        let service = service_with(factory.clone(), |c| {
            c.data.in_flight_policy = InFlightPolicy::Drop;
        });
        service.start();
        service.connect().await.unwrap();

        service.publish("a", Bytes::new(), Qos::AtLeastOnce, false, 5).unwrap();
        assert!(eventually(WAIT, || service.queue().in_flight_len() == 1).await);

        factory.link().drop_connection("network down");
        assert!(eventually(WAIT, || !service.is_connected()).await);
        service.connect().await.unwrap();

        assert_eq!(service.queue().list_dropped().len(), 1);
        assert_eq!(service.queue().in_flight_len(), 0);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_gasp_messages_flushed_on_disconnect() {
        struct LastGasp(Weak<Inner>);

        impl DataServiceListener for LastGasp {
            fn on_disconnecting(&self, _scope: &QuiesceScope) {
                if let Some(inner) = self.0.upgrade() {
                    inner
                        .queue
                        .enqueue(Message::new("bye", Bytes::new(), Qos::AtMostOnce, false, 0))
                        .unwrap();
                }
            }
        }

        let factory = Arc::new(MockLinkFactory::new());
        let service = service_with(factory.clone(), |_| {});
        service.add_listener(Arc::new(LastGasp(Arc::downgrade(&service.inner))));
        service.start();
        service.connect().await.unwrap();

        service.disconnect(Duration::from_secs(1)).await.unwrap();

        assert_eq!(factory.link().published_topics(), vec!["bye".to_string()]);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        let factory = Arc::new(MockLinkFactory::new());
        let service = service_with(factory.clone(), |c| {
            c.data.reconnect_backoff_secs = vec![0];
        });
        service.start();
        service.connect().await.unwrap();

        factory.link().drop_connection("broker restart");

        assert!(eventually(WAIT, || factory.link().connect_count() == 2).await);
        assert!(eventually(WAIT, || service.is_connected()).await);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_connect_on_start() {
        let factory = Arc::new(MockLinkFactory::new());
        let service = service_with(factory.clone(), |c| c.data.auto_connect = true);

        service.start();

        assert!(eventually(WAIT, || service.is_connected()).await);
        service.stop().await.unwrap();
        assert!(!service.is_connected());
    }

    #[tokio::test]
    async fn test_diagnostics_filter_by_topic() {
        let factory = Arc::new(MockLinkFactory::new());
        let service = service_with(factory, |_| {});

        let a = service.publish("acct/dev/A/x", Bytes::new(), Qos::AtLeastOnce, false, 5).unwrap();
        service.publish("acct/dev/B/x", Bytes::new(), Qos::AtLeastOnce, false, 5).unwrap();

        let pattern = Regex::new("^acct/.+/A(/.+)?").unwrap();
        assert_eq!(service.unpublished_message_ids(&pattern), vec![a]);
        assert!(service.in_flight_message_ids(&pattern).is_empty());
        assert!(service.dropped_in_flight_message_ids(&pattern).is_empty());
    }
}
