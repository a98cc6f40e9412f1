//! Callbacks delivered to one [`CloudClient`](super::CloudClient)

use crate::outbound::MessageId;
use crate::transport::Qos;

/// Events for one application id; every method defaults to a no-op
///
/// Topics are application topics, relative to `account/device/appId`.
/// Callbacks run on the transport's driver task or the publisher task and
/// must not block; hand long work to a task.
#[allow(unused_variables)]
pub trait CloudClientListener: Send + Sync {
    /// Data message addressed to this application
    fn on_message_arrived(
        &self,
        device_id: &str,
        app_topic: &str,
        payload: &[u8],
        qos: Qos,
        retained: bool,
    ) {
    }

    /// Control message addressed to this application
    fn on_control_message_arrived(
        &self,
        device_id: &str,
        app_topic: &str,
        payload: &[u8],
        qos: Qos,
        retained: bool,
    ) {
    }

    fn on_connection_established(&self) {}

    fn on_connection_lost(&self) {}

    fn on_message_published(&self, id: MessageId, app_topic: &str) {}

    fn on_message_confirmed(&self, id: MessageId, app_topic: &str) {}
}
