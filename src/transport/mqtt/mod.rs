//! rumqttc-backed [`BrokerLink`](crate::transport::BrokerLink)

pub mod events;
pub mod link;
pub mod options;

pub use events::{route_mqtt_event, EventRoute};
pub use link::{RumqttLink, RumqttLinkFactory};
pub use options::configure_mqtt_options;
