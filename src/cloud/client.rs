//! Per-application handle onto the shared connection

use super::listener::CloudClientListener;
use super::service::CloudInner;
use crate::error::CloudResult;
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::outbound::MessageId;
use crate::protocol::{ACCOUNT_NAME_VARIABLE, CLIENT_ID_VARIABLE};
use crate::transport::Qos;
use bytes::Bytes;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Routing entry shared between a [`CloudClient`] and the cloud service
pub(crate) struct ClientCore {
    pub(crate) id: u64,
    pub(crate) app_id: String,
    pub(crate) listeners: ListenerRegistry<dyn CloudClientListener>,
    /// Topic templates this client owns, re-subscribed after every reconnect
    subscriptions: Mutex<BTreeMap<String, Qos>>,
    released: AtomicBool,
}

impl ClientCore {
    pub(crate) fn new(id: u64, app_id: &str) -> Self {
        Self {
            id,
            app_id: app_id.to_string(),
            listeners: ListenerRegistry::new(),
            subscriptions: Mutex::new(BTreeMap::new()),
            released: AtomicBool::new(false),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, BTreeMap<String, Qos>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn track(&self, topic: &str, qos: Qos) {
        self.subscriptions().insert(topic.to_string(), qos);
    }

    pub(crate) fn tracked(&self) -> Vec<(String, Qos)> {
        self.subscriptions()
            .iter()
            .map(|(topic, qos)| (topic.clone(), *qos))
            .collect()
    }

    pub(crate) fn is_tracking(&self, topic: &str) -> bool {
        self.subscriptions().contains_key(topic)
    }

    fn untrack(&self, topic: &str) -> bool {
        self.subscriptions().remove(topic).is_some()
    }

    fn take_all(&self) -> Vec<String> {
        std::mem::take(&mut *self.subscriptions())
            .into_keys()
            .collect()
    }
}

/// Publish/subscribe scoped to one application id
///
/// Topics passed in are application topics. They are qualified as
/// `account/device/appId/appTopic`, with the account name and (unless a
/// device is given) the client id resolved by the transport.
pub struct CloudClient {
    core: Arc<ClientCore>,
    cloud: Arc<CloudInner>,
    diagnostics: Regex,
}

impl CloudClient {
    pub(crate) fn new(core: Arc<ClientCore>, cloud: Arc<CloudInner>) -> CloudResult<Self> {
        let pattern = format!(
            r"^({}/)?{}/.+/{}(/.+)?",
            regex::escape(cloud.namespace.control_prefix()),
            regex::escape(ACCOUNT_NAME_VARIABLE),
            regex::escape(&core.app_id)
        );
        let diagnostics = Regex::new(&pattern).map_err(|e| {
            crate::error::CloudError::internal_error(format!("diagnostics pattern: {e}"))
        })?;

        Ok(Self {
            core,
            cloud,
            diagnostics,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.core.app_id
    }

    pub fn is_connected(&self) -> bool {
        self.cloud.data.is_connected()
    }

    fn topic(&self, device_id: &str, app_topic: &str, control: bool) -> String {
        self.cloud.namespace.build_topic(
            ACCOUNT_NAME_VARIABLE,
            device_id,
            &self.core.app_id,
            app_topic,
            control,
        )
    }

    fn enqueue(
        &self,
        topic: String,
        payload: Bytes,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> CloudResult<MessageId> {
        let id = self
            .cloud
            .data
            .publish(&topic, payload, qos, retain, priority)?;
        debug!(app_id = %self.core.app_id, message_id = id, topic = %topic, "Queued");
        Ok(id)
    }

    /// Publish on this gateway's own data topic
    pub fn publish(
        &self,
        app_topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> CloudResult<MessageId> {
        self.publish_to(CLIENT_ID_VARIABLE, app_topic, payload, qos, retain, priority)
    }

    /// Publish on another device's data topic
    pub fn publish_to(
        &self,
        device_id: &str,
        app_topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> CloudResult<MessageId> {
        let topic = self.topic(device_id, app_topic, false);
        self.enqueue(topic, payload.into(), qos, retain, priority)
    }

    pub fn control_publish(
        &self,
        app_topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> CloudResult<MessageId> {
        self.control_publish_to(CLIENT_ID_VARIABLE, app_topic, payload, qos, retain, priority)
    }

    /// Publish on another device's control topic, e.g. a Cloudlet reply
    pub fn control_publish_to(
        &self,
        device_id: &str,
        app_topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> CloudResult<MessageId> {
        let topic = self.topic(device_id, app_topic, true);
        self.enqueue(topic, payload.into(), qos, retain, priority)
    }

    async fn subscribe_topic(&self, topic: String, qos: Qos) -> CloudResult<()> {
        self.cloud.data.subscribe(&topic, qos).await?;
        self.core.track(&topic, qos);
        Ok(())
    }

    /// The broker subscription stays while another client still owns the topic
    async fn unsubscribe_topic(&self, topic: String) -> CloudResult<()> {
        if !self.cloud.shared_with_others(self.core.id, &topic) {
            self.cloud.data.unsubscribe(&topic).await?;
        }
        self.core.untrack(&topic);
        Ok(())
    }

    pub async fn subscribe(&self, app_topic: &str, qos: Qos) -> CloudResult<()> {
        self.subscribe_topic(self.topic(CLIENT_ID_VARIABLE, app_topic, false), qos)
            .await
    }

    pub async fn control_subscribe(&self, app_topic: &str, qos: Qos) -> CloudResult<()> {
        self.subscribe_topic(self.topic(CLIENT_ID_VARIABLE, app_topic, true), qos)
            .await
    }

    pub async fn unsubscribe(&self, app_topic: &str) -> CloudResult<()> {
        self.unsubscribe_topic(self.topic(CLIENT_ID_VARIABLE, app_topic, false))
            .await
    }

    pub async fn control_unsubscribe(&self, app_topic: &str) -> CloudResult<()> {
        self.unsubscribe_topic(self.topic(CLIENT_ID_VARIABLE, app_topic, true))
            .await
    }

    /// Topic templates currently owned by this client
    pub fn subscriptions(&self) -> Vec<String> {
        self.core.tracked().into_iter().map(|(t, _)| t).collect()
    }

    pub fn add_cloud_client_listener(&self, listener: Arc<dyn CloudClientListener>) -> ListenerId {
        self.core.listeners.add(listener)
    }

    /// No deliveries reach the listener once this returns
    pub fn remove_cloud_client_listener(&self, id: ListenerId) -> bool {
        self.core.listeners.remove(id)
    }

    pub fn unpublished_message_ids(&self) -> Vec<MessageId> {
        self.cloud.data.unpublished_message_ids(&self.diagnostics)
    }

    pub fn in_flight_message_ids(&self) -> Vec<MessageId> {
        self.cloud.data.in_flight_message_ids(&self.diagnostics)
    }

    pub fn dropped_in_flight_message_ids(&self) -> Vec<MessageId> {
        self.cloud.data.dropped_in_flight_message_ids(&self.diagnostics)
    }

    pub fn is_released(&self) -> bool {
        self.core.released.load(Ordering::SeqCst)
    }

    /// Deregister, drop all listeners and unsubscribe everything this client owns
    ///
    /// Topics another live client also owns stay subscribed at the broker.
    /// Unsubscribe failures are logged; the client is released regardless.
    pub async fn release(&self) {
        if self.core.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cloud.deregister(self.core.id);
        let removed = self.core.listeners.clear();

        let topics = self.core.take_all();
        if self.cloud.data.is_connected() {
            for topic in topics
                .iter()
                .filter(|topic| !self.cloud.shared_with_others(self.core.id, topic))
            {
                if let Err(e) = self.cloud.data.unsubscribe(topic).await {
                    warn!(app_id = %self.core.app_id, topic = %topic, error = %e, "Unsubscribe on release failed");
                }
            }
        }

        info!(
            app_id = %self.core.app_id,
            listeners = removed,
            subscriptions = topics.len(),
            "Cloud client released"
        );
    }
}

impl std::fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClient")
            .field("app_id", &self.core.app_id)
            .field("released", &self.is_released())
            .finish()
    }
}
