//! Pure routing of rumqttc events
//!
//! The link driver only acts on [`EventRoute`]s, which keeps rumqttc's
//! packet types out of the correlation logic and makes it testable.

use super::options::from_rumqtt_qos;
use crate::transport::Qos;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Routing decisions for rumqttc events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged {
        session_present: bool,
        accepted: bool,
    },
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    },
    /// A publish left the client; pkid 0 for QoS 0
    PublishSent { pkid: u16 },
    /// PUBACK for QoS 1 or PUBCOMP for QoS 2
    DeliveryAcknowledged { pkid: u16 },
    SubscribeSent { pkid: u16 },
    SubscriptionAcknowledged { pkid: u16, accepted: bool },
    UnsubscribeSent { pkid: u16 },
    UnsubscriptionAcknowledged { pkid: u16 },
    /// Broker sent DISCONNECT
    Disconnected,
    /// We sent DISCONNECT
    DisconnectSent,
    Other,
}

pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(ack) => EventRoute::ConnectionAcknowledged {
                session_present: ack.session_present,
                accepted: ack.code == ConnectReturnCode::Success,
            },
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
                qos: from_rumqtt_qos(publish.qos),
                retain: publish.retain,
            },
            Packet::PubAck(ack) => EventRoute::DeliveryAcknowledged { pkid: ack.pkid },
            Packet::PubComp(comp) => EventRoute::DeliveryAcknowledged { pkid: comp.pkid },
            Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                pkid: suback.pkid,
                accepted: suback
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
            },
            Packet::UnsubAck(unsuback) => {
                EventRoute::UnsubscriptionAcknowledged { pkid: unsuback.pkid }
            }
            Packet::Disconnect(_) => EventRoute::Disconnected,
            _ => EventRoute::Other,
        },
        Event::Outgoing(outgoing) => match outgoing {
            Outgoing::Publish(pkid) => EventRoute::PublishSent { pkid: *pkid },
            Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent { pkid: *pkid },
            Outgoing::Unsubscribe(pkid) => EventRoute::UnsubscribeSent { pkid: *pkid },
            Outgoing::Disconnect => EventRoute::DisconnectSent,
            _ => EventRoute::Other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{PubAck, PubAckReason, Publish};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_incoming_publish_route() {
        let publish = Publish::new("$EDC/acct/gw/APP/GET/x", QoS::AtLeastOnce, "hi", None);
        let route = route_mqtt_event(&Event::Incoming(Packet::Publish(publish)));

        assert_eq!(
            route,
            EventRoute::MessageReceived {
                topic: "$EDC/acct/gw/APP/GET/x".to_string(),
                payload: Bytes::from_static(b"hi"),
                qos: Qos::AtLeastOnce,
                retain: false,
            }
        );
    }

    #[test]
    fn test_puback_is_delivery_acknowledgement() {
        let ack = PubAck {
            pkid: 7,
            reason: PubAckReason::Success,
            properties: None,
        };
        assert_eq!(
            route_mqtt_event(&Event::Incoming(Packet::PubAck(ack))),
            EventRoute::DeliveryAcknowledged { pkid: 7 }
        );
    }

    #[test]
    fn test_outgoing_routes() {
        assert_eq!(
            route_mqtt_event(&Event::Outgoing(Outgoing::Publish(3))),
            EventRoute::PublishSent { pkid: 3 }
        );
        assert_eq!(
            route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(4))),
            EventRoute::SubscribeSent { pkid: 4 }
        );
        assert_eq!(
            route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::Other
        );
    }
}
