//! Mapping [`ConnectOptions`] onto rumqttc's MQTT v5 options

use crate::transport::{ConnectOptions, LinkError, Qos};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Large enough for typical telemetry batches; brokers default to much less
const MAX_PACKET_SIZE: u32 = 256 * 1024;

// rumqttc refuses keep-alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

pub fn to_rumqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub fn from_rumqtt_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}

/// Build rumqttc options from a validated connect request
pub fn configure_mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, LinkError> {
    let url = Url::parse(&options.broker_url).map_err(|e| {
        LinkError::ConnectFailed(format!("invalid broker URL {}: {e}", options.broker_url))
    })?;

    let host = url
        .host_str()
        .ok_or_else(|| LinkError::ConnectFailed(format!("no host in {}", options.broker_url)))?;
    let secure = url.scheme() == "mqtts";
    let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);

    if secure {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &options.username {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    mqtt_options.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt_options.set_clean_start(options.clean_session);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(will) = &options.last_will {
        mqtt_options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_rumqtt_qos(will.qos),
            will.retain,
            None,
        ));
    }

    Ok(mqtt_options)
}
