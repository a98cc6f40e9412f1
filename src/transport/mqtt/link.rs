//! [`BrokerLink`] over rumqttc's MQTT v5 client
//!
//! rumqttc assigns packet ids inside its event loop, so the link correlates
//! requests with the `Outgoing` notifications it emits, strictly in request
//! order. Every QoS>0 publish also gets a link-level message id which is
//! what callers see: it stays stable when the publish is resent from the
//! delivery store under a new packet id.
//!
//! The event loop is kept across connects while the options are unchanged
//! and the session is persistent, so rumqttc resends unacknowledged
//! publishes under their original packet ids.

use super::events::{route_mqtt_event, EventRoute};
use super::options::{configure_mqtt_options, to_rumqtt_qos};
use crate::mqtt_span;
use crate::transport::persistence::{DeliveryStore, PersistedDelivery};
use crate::transport::{
    BrokerLink, ConnectOptions, LinkError, LinkEvent, LinkFactory, ProtocolVersion, Qos,
    SessionIdentity,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const REQUEST_CAPACITY: usize = 64;
const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

type AckSender = oneshot::Sender<Result<(), LinkError>>;

struct PendingPublish {
    message_id: u16,
    /// None for resends from the delivery store
    sent: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Correlation {
    publishes: VecDeque<PendingPublish>,
    subscribes: VecDeque<AckSender>,
    unsubscribes: VecDeque<AckSender>,
    subscribe_acks: HashMap<u16, AckSender>,
    unsubscribe_acks: HashMap<u16, AckSender>,
    /// packet id -> link message id
    in_flight: HashMap<u16, u16>,
}

#[derive(Default)]
struct MessageIds {
    last: u16,
    outstanding: BTreeSet<u16>,
}

impl MessageIds {
    fn allocate(&mut self) -> Result<u16, LinkError> {
        if self.outstanding.len() >= usize::from(u16::MAX) {
            return Err(LinkError::TooManyInFlight);
        }
        loop {
            self.last = self.last.wrapping_add(1);
            if self.last != 0 && self.outstanding.insert(self.last) {
                return Ok(self.last);
            }
        }
    }

    fn release(&mut self, id: u16) {
        self.outstanding.remove(&id);
    }
}

struct LinkShared {
    store: Arc<dyn DeliveryStore>,
    correlation: Mutex<Correlation>,
    ids: Mutex<MessageIds>,
    drained: Notify,
    closing: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LinkShared {
    fn is_drained(&self) -> bool {
        let correlation = lock(&self.correlation);
        correlation.in_flight.is_empty() && correlation.publishes.is_empty()
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }

    /// Forget every request tied to a discarded event loop
    fn reset_correlation(&self) {
        *lock(&self.correlation) = Correlation::default();
    }

    fn reseed_ids(&self) {
        let pending: BTreeSet<u16> = self
            .store
            .pending()
            .map(|p| p.into_iter().map(|d| d.message_id).collect())
            .unwrap_or_default();
        lock(&self.ids).outstanding = pending;
    }

    fn fail_subscriptions(&self, cause: &str) {
        let mut guard = lock(&self.correlation);
        let correlation = &mut *guard;
        let waiting: Vec<AckSender> = correlation
            .subscribes
            .drain(..)
            .chain(correlation.unsubscribes.drain(..))
            .collect();
        let acks: Vec<AckSender> = correlation
            .subscribe_acks
            .drain()
            .chain(correlation.unsubscribe_acks.drain())
            .map(|(_, tx)| tx)
            .collect();
        drop(guard);

        for tx in waiting.into_iter().chain(acks) {
            let _ = tx.send(Err(LinkError::RequestFailed(cause.to_string())));
        }
    }

    /// Apply one routed event; returns false when the driver should stop
    fn handle(&self, route: EventRoute, events: &mpsc::UnboundedSender<LinkEvent>) -> bool {
        match route {
            EventRoute::MessageReceived {
                topic,
                payload,
                qos,
                retain,
            } => {
                let _ = events.send(LinkEvent::MessageArrived {
                    topic,
                    payload,
                    qos,
                    retained: retain,
                });
            }
            EventRoute::PublishSent { pkid: 0 } => {}
            EventRoute::PublishSent { pkid } => {
                let mut correlation = lock(&self.correlation);
                if correlation.in_flight.contains_key(&pkid) {
                    debug!(pkid = pkid, "Retransmitted publish");
                } else if let Some(pending) = correlation.publishes.pop_front() {
                    correlation.in_flight.insert(pkid, pending.message_id);
                    if let Some(sent) = pending.sent {
                        let _ = sent.send(());
                    }
                } else {
                    warn!(pkid = pkid, "Outgoing publish without a pending request");
                }
            }
            EventRoute::DeliveryAcknowledged { pkid } => {
                let (message_id, drained) = {
                    let mut correlation = lock(&self.correlation);
                    let id = correlation.in_flight.remove(&pkid);
                    (
                        id,
                        correlation.in_flight.is_empty() && correlation.publishes.is_empty(),
                    )
                };

                match message_id {
                    Some(message_id) => {
                        if let Err(e) = self.store.remove(message_id) {
                            error!(message_id = message_id, error = %e, "Failed to drop acknowledged delivery");
                        }
                        lock(&self.ids).release(message_id);
                        let _ = events.send(LinkEvent::DeliveryComplete { message_id });
                    }
                    None => debug!(pkid = pkid, "Acknowledgement for unknown packet"),
                }

                if drained {
                    self.drained.notify_waiters();
                }
            }
            EventRoute::SubscribeSent { pkid } => {
                let mut correlation = lock(&self.correlation);
                if let Some(tx) = correlation.subscribes.pop_front() {
                    correlation.subscribe_acks.insert(pkid, tx);
                }
            }
            EventRoute::SubscriptionAcknowledged { pkid, accepted } => {
                if let Some(tx) = lock(&self.correlation).subscribe_acks.remove(&pkid) {
                    let result = if accepted {
                        Ok(())
                    } else {
                        Err(LinkError::RequestFailed(
                            "subscription rejected by broker".to_string(),
                        ))
                    };
                    let _ = tx.send(result);
                }
            }
            EventRoute::UnsubscribeSent { pkid } => {
                let mut correlation = lock(&self.correlation);
                if let Some(tx) = correlation.unsubscribes.pop_front() {
                    correlation.unsubscribe_acks.insert(pkid, tx);
                }
            }
            EventRoute::UnsubscriptionAcknowledged { pkid } => {
                if let Some(tx) = lock(&self.correlation).unsubscribe_acks.remove(&pkid) {
                    let _ = tx.send(Ok(()));
                }
            }
            EventRoute::Disconnected => {
                if !self.closing.load(Ordering::SeqCst) {
                    let _ = events.send(LinkEvent::ConnectionLost {
                        cause: "broker sent DISCONNECT".to_string(),
                    });
                }
                return false;
            }
            EventRoute::DisconnectSent => return false,
            EventRoute::ConnectionAcknowledged { .. } | EventRoute::Other => {}
        }
        true
    }
}

async fn drive(
    mut eventloop: EventLoop,
    shared: Arc<LinkShared>,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> EventLoop {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            polled = eventloop.poll() => match polled {
                Ok(event) => {
                    if !shared.handle(route_mqtt_event(&event), &events) {
                        break;
                    }
                }
                Err(e) => {
                    if !shared.closing.load(Ordering::SeqCst) {
                        let _ = events.send(LinkEvent::ConnectionLost { cause: e.to_string() });
                    }
                    break;
                }
            }
        }
    }

    shared.fail_subscriptions("connection closed");
    debug!("MQTT event loop stopped");
    eventloop
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<bool, LinkError> {
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                if let EventRoute::ConnectionAcknowledged {
                    session_present,
                    accepted,
                } = route_mqtt_event(&event)
                {
                    return if accepted {
                        Ok(session_present)
                    } else {
                        Err(LinkError::ConnectFailed(
                            "connection refused by broker".to_string(),
                        ))
                    };
                }
                debug!(event = ?event, "Bootstrap phase notification");
            }
            Err(e) => return Err(LinkError::ConnectFailed(e.to_string())),
        }
    }
}

#[derive(Default)]
struct Session {
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
    options: Option<ConnectOptions>,
    driver: Option<JoinHandle<EventLoop>>,
    shutdown: Option<watch::Sender<bool>>,
}

pub struct RumqttLink {
    identity: SessionIdentity,
    shared: Arc<LinkShared>,
    session: tokio::sync::Mutex<Session>,
    /// Set while connected
    client: RwLock<Option<AsyncClient>>,
    /// Keeps request order equal to the order of `Outgoing` notifications
    request_lock: tokio::sync::Mutex<()>,
}

impl RumqttLink {
    pub fn new(identity: SessionIdentity, store: Arc<dyn DeliveryStore>) -> Self {
        let shared = Arc::new(LinkShared {
            store,
            correlation: Mutex::new(Correlation::default()),
            ids: Mutex::new(MessageIds::default()),
            drained: Notify::new(),
            closing: AtomicBool::new(false),
        });
        shared.reseed_ids();

        Self {
            identity,
            shared,
            session: tokio::sync::Mutex::new(Session::default()),
            client: RwLock::new(None),
            request_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn client(&self) -> Result<AsyncClient, LinkError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(LinkError::NotConnected)
    }

    fn set_client(&self, client: Option<AsyncClient>) -> Option<AsyncClient> {
        std::mem::replace(
            &mut *self.client.write().unwrap_or_else(PoisonError::into_inner),
            client,
        )
    }

    /// Resend deliveries persisted by an earlier event loop under their original ids
    async fn resend_persisted(&self, client: &AsyncClient) {
        let pending = match self.shared.store.pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Cannot read persisted deliveries");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "Resending persisted deliveries");
        for delivery in pending {
            let _guard = self.request_lock.lock().await;
            lock(&self.shared.correlation)
                .publishes
                .push_back(PendingPublish {
                    message_id: delivery.message_id,
                    sent: None,
                });
            if let Err(e) = client
                .publish(
                    delivery.topic.clone(),
                    to_rumqtt_qos(delivery.qos),
                    delivery.retain,
                    delivery.payload,
                )
                .await
            {
                lock(&self.shared.correlation).publishes.pop_back();
                warn!(message_id = delivery.message_id, error = %e, "Resend failed");
            }
        }
    }

    async fn stop_driver(session: &mut Session) {
        let Some(mut driver) = session.driver.take() else {
            return;
        };
        let shutdown = session.shutdown.take();

        let stopped = match tokio::time::timeout(DRIVER_STOP_TIMEOUT, &mut driver).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(tx) = shutdown {
                    let _ = tx.send(true);
                }
                driver.await
            }
        };

        match stopped {
            Ok(eventloop) => session.eventloop = Some(eventloop),
            Err(e) => warn!(error = %e, "MQTT driver task failed"),
        }
    }
}

#[async_trait]
impl BrokerLink for RumqttLink {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, LinkError> {
        if options.protocol != ProtocolVersion::V5 {
            return Err(LinkError::Unsupported(format!(
                "MQTT {} is not supported by this link, use protocol_version = \"5\"",
                options.protocol
            )));
        }

        let mut session = self.session.lock().await;
        self.shared.closing.store(false, Ordering::SeqCst);

        // A driver that stopped on connection loss still holds the event loop
        if let Some(tx) = session.shutdown.as_ref() {
            let _ = tx.send(true);
        }
        Self::stop_driver(&mut session).await;

        let reusable = !options.clean_session && session.options.as_ref() == Some(options);
        let resumed = match (reusable, session.client.clone(), session.eventloop.take()) {
            (true, Some(client), Some(eventloop)) => Some((client, eventloop)),
            _ => None,
        };
        let fresh = resumed.is_none();

        let (client, mut eventloop) = match resumed {
            Some(pair) => pair,
            None => {
                self.shared.reset_correlation();
                if options.clean_session {
                    self.shared.store.clear()?;
                }
                self.shared.reseed_ids();
                AsyncClient::new(configure_mqtt_options(options)?, REQUEST_CAPACITY)
            }
        };
        session.options = Some(options.clone());
        session.client = Some(client.clone());

        let span = mqtt_span!(operation = "connect", client_id = %self.identity.client_id);
        let session_present = wait_for_connack(&mut eventloop).instrument(span).await?;
        debug!(session_present = session_present, fresh = fresh, "CONNACK received");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        session.driver = Some(tokio::spawn(drive(
            eventloop,
            self.shared.clone(),
            events_tx,
            shutdown_rx,
        )));
        session.shutdown = Some(shutdown_tx);
        self.set_client(Some(client.clone()));

        if fresh && !options.clean_session {
            self.resend_persisted(&client).await;
        }

        Ok(events_rx)
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), LinkError> {
        let mut session = self.session.lock().await;
        let Some(client) = self.set_client(None) else {
            return Ok(());
        };

        if tokio::time::timeout(timeout, self.shared.wait_drained())
            .await
            .is_err()
        {
            debug!("Disconnecting with unacknowledged deliveries");
        }

        self.shared.closing.store(true, Ordering::SeqCst);
        let result = client
            .disconnect()
            .await
            .map_err(|e| LinkError::RequestFailed(e.to_string()));

        Self::stop_driver(&mut session).await;
        result
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError> {
        let client = self.client()?;
        let (tx, rx) = oneshot::channel();
        {
            let _guard = self.request_lock.lock().await;
            lock(&self.shared.correlation).subscribes.push_back(tx);
            if let Err(e) = client.subscribe(topic, to_rumqtt_qos(qos)).await {
                lock(&self.shared.correlation).subscribes.pop_back();
                return Err(LinkError::RequestFailed(e.to_string()));
            }
        }
        rx.await.map_err(|_| LinkError::NotConnected)?
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        let client = self.client()?;
        let (tx, rx) = oneshot::channel();
        {
            let _guard = self.request_lock.lock().await;
            lock(&self.shared.correlation).unsubscribes.push_back(tx);
            if let Err(e) = client.unsubscribe(topic).await {
                lock(&self.shared.correlation).unsubscribes.pop_back();
                return Err(LinkError::RequestFailed(e.to_string()));
            }
        }
        rx.await.map_err(|_| LinkError::NotConnected)?
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<u16, LinkError> {
        let client = self.client()?;

        if !qos.requires_ack() {
            client
                .publish(topic, to_rumqtt_qos(qos), retain, payload)
                .await
                .map_err(|e| LinkError::RequestFailed(e.to_string()))?;
            return Ok(0);
        }

        let (tx, rx) = oneshot::channel();
        let message_id = {
            let _guard = self.request_lock.lock().await;
            let message_id = lock(&self.shared.ids).allocate()?;

            let delivery = PersistedDelivery {
                message_id,
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
                retain,
            };
            if let Err(e) = self.shared.store.put(delivery) {
                lock(&self.shared.ids).release(message_id);
                return Err(e.into());
            }

            lock(&self.shared.correlation)
                .publishes
                .push_back(PendingPublish {
                    message_id,
                    sent: Some(tx),
                });

            if let Err(e) = client
                .publish(topic, to_rumqtt_qos(qos), retain, payload)
                .await
            {
                lock(&self.shared.correlation).publishes.pop_back();
                let _ = self.shared.store.remove(message_id);
                lock(&self.shared.ids).release(message_id);
                return Err(LinkError::RequestFailed(e.to_string()));
            }
            message_id
        };

        rx.await.map_err(|_| LinkError::NotConnected)?;
        Ok(message_id)
    }

    fn pending_deliveries(&self) -> usize {
        self.shared.store.pending_count()
    }

    fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.set_client(None);
        self.shared.fail_subscriptions("link closed");

        if let Ok(mut session) = self.session.try_lock() {
            if let Some(tx) = session.shutdown.take() {
                let _ = tx.send(true);
            }
            if let Some(driver) = session.driver.take() {
                driver.abort();
            }
            session.eventloop = None;
            session.client = None;
            session.options = None;
        }
    }
}

/// Creates one [`RumqttLink`] per session identity
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttLinkFactory;

impl LinkFactory for RumqttLinkFactory {
    fn create(
        &self,
        identity: &SessionIdentity,
        store: Arc<dyn DeliveryStore>,
    ) -> Result<Arc<dyn BrokerLink>, LinkError> {
        info!(
            broker_url = %identity.broker_url,
            client_id = %identity.client_id,
            persistence = %identity.persistence,
            "Creating MQTT link"
        );
        Ok(Arc::new(RumqttLink::new(identity.clone(), store)))
    }
}
