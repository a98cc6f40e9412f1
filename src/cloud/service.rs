//! Cloud service: creates CloudClients and routes traffic between them and
//! the DataService
//!
//! Lifecycle certificates announce the gateway on its control topics:
//!
//! - `MQTT/BIRTH` on every established connection;
//! - `MQTT/DC` on orderly disconnect, as a last-gasp message;
//! - `MQTT/APPS` whenever the set of application ids changes while connected.

use super::client::{ClientCore, CloudClient};
use crate::config::CloudSection;
use crate::error::{CloudError, CloudResult};
use crate::listeners::ListenerId;
use crate::outbound::{DataService, DataServiceListener, MessageId, LIFECYCLE_PRIORITY};
use crate::protocol::{
    validate_app_id, CloudPayload, ParsedTopic, TopicNamespace, ACCOUNT_NAME_VARIABLE,
    CLIENT_ID_VARIABLE,
};
use crate::transport::{Qos, QuiesceScope, SystemInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn};

const LIFECYCLE_APP_ID: &str = "MQTT";
const BIRTH_TOPIC: &str = "BIRTH";
const DISCONNECT_TOPIC: &str = "DC";
const APPS_TOPIC: &str = "APPS";

/// Broker feedback; never routed to applications
const FEEDBACK_APP_ID: &str = "BA";

pub(crate) struct CloudInner {
    pub(crate) data: Arc<DataService>,
    pub(crate) namespace: TopicNamespace,
    settings: CloudSection,
    system: Arc<dyn SystemInfo>,
    clients: RwLock<Vec<Arc<ClientCore>>>,
    next_client_id: AtomicU64,
    started_at: Instant,
}

impl CloudInner {
    fn clients(&self) -> Vec<Arc<ClientCore>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clients_for(&self, app_id: &str) -> Vec<Arc<ClientCore>> {
        self.clients()
            .into_iter()
            .filter(|c| c.app_id == app_id)
            .collect()
    }

    fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for client in self.clients() {
            if !ids.contains(&client.app_id) {
                ids.push(client.app_id.clone());
            }
        }
        ids
    }

    fn register(&self, core: Arc<ClientCore>) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(core);
    }

    pub(crate) fn deregister(&self, id: u64) {
        let removed = {
            let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
            let before = clients.len();
            clients.retain(|c| c.id != id);
            before != clients.len()
        };

        if removed && self.data.is_connected() {
            self.publish_apps_certificate();
        }
    }

    /// True if a client other than `client_id` still owns `topic`
    pub(crate) fn shared_with_others(&self, client_id: u64, topic: &str) -> bool {
        self.clients()
            .iter()
            .any(|c| c.id != client_id && c.is_tracking(topic))
    }

    fn lifecycle_qos(&self) -> Qos {
        Qos::try_from(self.settings.lifecycle_qos).unwrap_or(Qos::AtMostOnce)
    }

    fn publish_lifecycle(&self, suffix: &str, payload: CloudPayload) {
        let topic = self.namespace.build_topic(
            ACCOUNT_NAME_VARIABLE,
            CLIENT_ID_VARIABLE,
            LIFECYCLE_APP_ID,
            suffix,
            true,
        );

        match self.data.publish(
            &topic,
            payload.encode(),
            self.lifecycle_qos(),
            self.settings.lifecycle_retain,
            LIFECYCLE_PRIORITY,
        ) {
            Ok(id) => debug!(topic = %topic, message_id = id, "Lifecycle certificate queued"),
            Err(e) => error!(topic = %topic, error = %e, "Failed to queue lifecycle certificate"),
        }
    }

    fn uptime_millis(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn birth_payload(&self) -> CloudPayload {
        let transport = self.data.transport();
        let mut payload = CloudPayload::new()
            .with_metric("uptime", self.uptime_millis())
            .with_metric("display_name", self.settings.display_name.as_str())
            .with_metric("application_ids", self.app_ids().join(","));

        if let Some(client_id) = transport.client_id() {
            payload.add_metric("client_id", client_id);
        }
        if let Some(account_name) = transport.account_name() {
            payload.add_metric("account_name", account_name);
        }
        if let Some(model) = self.system.model_name() {
            payload.add_metric("model_name", model);
        }
        payload
    }

    fn publish_birth_certificate(&self) {
        self.publish_lifecycle(BIRTH_TOPIC, self.birth_payload());
    }

    fn publish_disconnect_certificate(&self) {
        let payload = CloudPayload::new().with_metric("uptime", self.uptime_millis());
        self.publish_lifecycle(DISCONNECT_TOPIC, payload);
    }

    fn publish_apps_certificate(&self) {
        self.publish_lifecycle(APPS_TOPIC, self.birth_payload());
    }

    /// Restore every subscription a client owns; runs off the driver task
    fn resubscribe(&self, core: Arc<ClientCore>) {
        let data = self.data.clone();
        tokio::spawn(async move {
            for (topic, qos) in core.tracked() {
                if let Err(e) = data.subscribe(&topic, qos).await {
                    warn!(app_id = %core.app_id, topic = %topic, error = %e, "Re-subscribe failed");
                }
            }
        });
    }

    fn route(&self, topic: &str) -> Option<(ParsedTopic, Vec<Arc<ClientCore>>)> {
        let parsed = self.namespace.parse(topic)?;
        let clients = self.clients_for(&parsed.app_id);
        Some((parsed, clients))
    }
}

/// DataService events routed into the cloud service
struct CloudBridge(Weak<CloudInner>);

impl DataServiceListener for CloudBridge {
    fn on_connection_established(&self, _new_session: bool) {
        let Some(inner) = self.0.upgrade() else { return };

        inner.publish_birth_certificate();
        for core in inner.clients() {
            inner.resubscribe(core.clone());
            core.listeners
                .for_each("connection_established", |l| l.on_connection_established());
        }
    }

    fn on_disconnecting(&self, _scope: &QuiesceScope) {
        if let Some(inner) = self.0.upgrade() {
            inner.publish_disconnect_certificate();
        }
    }

    fn on_connection_lost(&self, _cause: &str) {
        let Some(inner) = self.0.upgrade() else { return };
        for core in inner.clients() {
            core.listeners
                .for_each("connection_lost", |l| l.on_connection_lost());
        }
    }

    fn on_message_arrived(&self, topic: &str, payload: &[u8], qos: Qos, retained: bool) {
        let Some(inner) = self.0.upgrade() else { return };

        let Some((parsed, clients)) = inner.route(topic) else {
            debug!(topic = %topic, "Message outside the application namespace");
            return;
        };
        if parsed.app_id == FEEDBACK_APP_ID {
            info!(topic = %topic, "Ignoring feedback message");
            return;
        }
        if clients.is_empty() {
            debug!(topic = %topic, app_id = %parsed.app_id, "No client for application");
            return;
        }

        for core in clients {
            if parsed.is_control() {
                core.listeners.for_each("control_message_arrived", |l| {
                    l.on_control_message_arrived(
                        &parsed.device_id,
                        &parsed.app_topic,
                        payload,
                        qos,
                        retained,
                    )
                });
            } else {
                core.listeners.for_each("message_arrived", |l| {
                    l.on_message_arrived(&parsed.device_id, &parsed.app_topic, payload, qos, retained)
                });
            }
        }
    }

    fn on_message_published(&self, id: MessageId, topic: &str) {
        let Some(inner) = self.0.upgrade() else { return };
        if let Some((parsed, clients)) = inner.route(topic) {
            for core in clients {
                core.listeners.for_each("message_published", |l| {
                    l.on_message_published(id, &parsed.app_topic)
                });
            }
        }
    }

    fn on_message_confirmed(&self, id: MessageId, topic: &str) {
        let Some(inner) = self.0.upgrade() else { return };
        if let Some((parsed, clients)) = inner.route(topic) {
            for core in clients {
                core.listeners.for_each("message_confirmed", |l| {
                    l.on_message_confirmed(id, &parsed.app_topic)
                });
            }
        }
    }
}

pub struct CloudService {
    inner: Arc<CloudInner>,
    listener_id: ListenerId,
}

impl CloudService {
    pub fn new(section: &CloudSection, data: Arc<DataService>, system: Arc<dyn SystemInfo>) -> Self {
        let inner = Arc::new(CloudInner {
            data: data.clone(),
            namespace: TopicNamespace::new(&section.control_prefix),
            settings: section.clone(),
            system,
            clients: RwLock::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            started_at: Instant::now(),
        });
        let listener_id = data.add_listener(Arc::new(CloudBridge(Arc::downgrade(&inner))));

        Self { inner, listener_id }
    }

    /// Create a client for `app_id`
    ///
    /// The default control subscription is tracked right away and made
    /// immediately when connected, otherwise on the next connection.
    pub async fn new_cloud_client(&self, app_id: &str) -> CloudResult<CloudClient> {
        validate_app_id(app_id).map_err(|e| CloudError::bad_request(e.to_string()))?;

        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(ClientCore::new(id, app_id));
        let default_subscription = self.inner.namespace.default_subscription(
            ACCOUNT_NAME_VARIABLE,
            CLIENT_ID_VARIABLE,
            app_id,
        );
        core.track(&default_subscription, Qos::AtLeastOnce);

        let client = CloudClient::new(core.clone(), self.inner.clone())?;
        self.inner.register(core);
        info!(app_id = %app_id, "Cloud client created");

        if self.inner.data.is_connected() {
            if let Err(e) = self
                .inner
                .data
                .subscribe(&default_subscription, Qos::AtLeastOnce)
                .await
            {
                warn!(app_id = %app_id, error = %e, "Default subscription failed");
            }
            self.inner.publish_apps_certificate();
        }

        Ok(client)
    }

    /// Application ids with a live client, in creation order
    pub fn cloud_application_identifiers(&self) -> Vec<String> {
        self.inner.app_ids()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.data.is_connected()
    }

    pub fn namespace(&self) -> &TopicNamespace {
        &self.inner.namespace
    }

    pub fn data(&self) -> &Arc<DataService> {
        &self.inner.data
    }
}

impl Drop for CloudService {
    fn drop(&mut self) {
        self.inner.data.remove_listener(self.listener_id);
    }
}
