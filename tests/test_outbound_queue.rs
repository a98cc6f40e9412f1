//! Outbound queue tests
//!
//! Tests store-and-forward behavior of the publisher:
//! - Priority ordering, FIFO within a priority
//! - Capacity limits and the lifecycle/reply exemption
//! - Session-scoped confirmations
//! - Republish vs drop of unconfirmed messages after a session reset


use gateway_cloud::error::CloudError;
use gateway_cloud::outbound::{
    DataService, InFlightPolicy, Message, NextMessage, OutboundQueue, Publication,
    DEFAULT_PRIORITY, LIFECYCLE_PRIORITY, REPLY_PRIORITY,
};
use gateway_cloud::testing::mocks::{eventually, RecordingDataListener};
use gateway_cloud::transport::{Qos, TransportToken};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{config_with, mock_gateway, mock_transport, test_config, WAIT};

fn message(topic: &str, priority: u8, qos: Qos) -> Message {
    Message::new(topic, b"payload".to_vec(), qos, false, priority)
}

#[tokio::test]
async fn test_messages_leave_in_priority_order() {
    // Arrange: queue while offline
    let (gateway, factory) = mock_gateway(test_config());
    gateway.start();
    for (n, priority) in [5u8, 0, 1, 5, 0].into_iter().enumerate() {
        gateway
            .data()
            .publish(&format!("acct/gw-test/ORDER/m{n}"), b"x".to_vec(), Qos::AtMostOnce, false, priority)
            .unwrap();
    }

    // Act
    gateway.data().connect().await.unwrap();

    // Assert: [5,0,1,5,0] leaves as 0,0,1,5,5
    let link = factory.link();
    let ours = || {
        link.published_topics()
            .into_iter()
            .filter(|t| t.starts_with("acct/gw-test/ORDER/"))
            .collect::<Vec<_>>()
    };
    assert!(eventually(WAIT, || ours().len() == 5).await);
    assert_eq!(
        ours(),
        vec![
            "acct/gw-test/ORDER/m1",
            "acct/gw-test/ORDER/m4",
            "acct/gw-test/ORDER/m2",
            "acct/gw-test/ORDER/m0",
            "acct/gw-test/ORDER/m3",
        ]
    );
    gateway.stop().await.unwrap();
}

#[test]
fn test_capacity_exempts_lifecycle_and_replies() {
    // Arrange
    let queue = OutboundQueue::new(2);
    queue.enqueue(message("a", DEFAULT_PRIORITY, Qos::AtLeastOnce)).unwrap();
    queue.enqueue(message("b", DEFAULT_PRIORITY, Qos::AtLeastOnce)).unwrap();

    // Act
    let ordinary = queue.enqueue(message("c", DEFAULT_PRIORITY, Qos::AtLeastOnce));
    let lifecycle = queue.enqueue(message("d", LIFECYCLE_PRIORITY, Qos::AtMostOnce));
    let reply = queue.enqueue(message("e", REPLY_PRIORITY, Qos::AtMostOnce));

    // Assert
    assert!(matches!(ordinary, Err(CloudError::CapacityExceeded { capacity: 2 })));
    assert!(lifecycle.is_ok());
    assert!(reply.is_ok());
    assert_eq!(queue.unpublished_len(), 4);
}

#[test]
fn test_confirmation_from_previous_session_is_stale() {
    // Arrange
    let queue = OutboundQueue::new(10);
    queue.begin_session("gw-test-mqtt://a", true, InFlightPolicy::Republish);
    let id = queue.enqueue(message("t", DEFAULT_PRIORITY, Qos::AtLeastOnce)).unwrap();
    assert!(matches!(queue.next_unpublished(9), NextMessage::Ready(m) if m.id == id));
    let outcome = queue
        .mark_published(id, Some(TransportToken::new(4, "gw-test-mqtt://a")))
        .unwrap();
    assert_eq!(outcome, Publication::InFlight);

    // Act
    let stale = queue.confirm(&TransportToken::new(4, "gw-test-mqtt://b"));

    // Assert: the message stays in flight until its own session confirms
    assert!(matches!(stale, Err(CloudError::StaleConfirmation { message_id: 4, .. })));
    assert_eq!(queue.in_flight_len(), 1);
    let confirmed = queue
        .confirm(&TransportToken::new(4, "gw-test-mqtt://a"))
        .unwrap();
    assert_eq!(confirmed.map(|m| m.id), Some(id));
}

#[test]
fn test_confirmation_with_no_publish_in_progress_is_not_kept() {
    // Arrange: a confirmation arrives while nothing is being published
    let queue = OutboundQueue::new(10);
    queue.begin_session("gw-test-mqtt://a", true, InFlightPolicy::Republish);
    let late = queue.confirm(&TransportToken::new(5, "gw-test-mqtt://a")).unwrap();
    let id = queue.enqueue(message("t", DEFAULT_PRIORITY, Qos::AtLeastOnce)).unwrap();

    // Act: a fresh publish reuses the same transport id
    queue.begin_publish(id);
    let outcome = queue
        .mark_published(id, Some(TransportToken::new(5, "gw-test-mqtt://a")))
        .unwrap();

    // Assert
    assert!(late.is_none());
    assert_eq!(outcome, Publication::InFlight);
    assert_eq!(queue.in_flight_len(), 1);
}

#[tokio::test]
async fn test_late_ack_after_publish_timeout_does_not_confirm_next_publish() {
    // Arrange: timeout_secs = 1, broker stops answering
    let config = test_config();
    let (transport, factory) = mock_transport(&config);
    let service = DataService::new(&config.data, Arc::new(transport));
    let events = Arc::new(RecordingDataListener::default());
    service.add_listener(events.clone());
    service.start();
    service.connect().await.unwrap();
    let link = factory.link();
    link.set_unresponsive(true);

    let id = service
        .publish("acct/gw-test/METER/reading", b"1".to_vec(), Qos::AtLeastOnce, false, DEFAULT_PRIORITY)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Act: the ack for the timed-out attempt shows up late, then the
    // broker recovers and the retry is assigned the same transport id
    link.confirm(1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    link.set_unresponsive(false);

    // Assert: the retry waits for its own confirmation
    assert!(
        eventually(WAIT, || link
            .published()
            .iter()
            .any(|p| p.message_id == 1))
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.confirmed().is_empty());
    assert_eq!(service.queue().in_flight_len(), 1);

    link.confirm(1);
    assert!(eventually(WAIT, || events.confirmed() == vec![id]).await);
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_republish_policy_resends_unconfirmed_messages() {
    // Arrange
    let (gateway, factory) = mock_gateway(config_with("", "republish"));
    gateway.start();
    gateway.data().connect().await.unwrap();
    let client = gateway.cloud().new_cloud_client("METER").await.unwrap();
    let topic = "acct/gw-test/METER/reading".to_string();
    let link = factory.link();

    client
        .publish("reading", b"42".to_vec(), Qos::AtLeastOnce, false, DEFAULT_PRIORITY)
        .unwrap();
    assert!(eventually(WAIT, || link.published_topics().contains(&topic)).await);

    // Act: connection drops before the broker acknowledges
    link.drop_connection("network unreachable");
    let transport = gateway.transport().clone();
    assert!(eventually(WAIT, || transport.is_connected()).await);

    // Assert: sent again on the new session, and confirmable there
    assert!(
        eventually(WAIT, || link
            .published_topics()
            .iter()
            .filter(|t| **t == topic)
            .count()
            == 2)
        .await
    );
    link.confirm_all();
    let data = gateway.data().clone();
    assert!(eventually(WAIT, || data.queue().is_idle()).await);
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_drop_policy_discards_unconfirmed_messages() {
    // Arrange
    let (gateway, factory) = mock_gateway(config_with("", "drop"));
    gateway.start();
    gateway.data().connect().await.unwrap();
    let client = gateway.cloud().new_cloud_client("METER").await.unwrap();
    let link = factory.link();

    let id = client
        .publish("reading", b"42".to_vec(), Qos::AtLeastOnce, false, DEFAULT_PRIORITY)
        .unwrap();
    assert!(eventually(WAIT, || client.in_flight_message_ids() == vec![id]).await);

    // Act
    link.drop_connection("network unreachable");
    let transport = gateway.transport().clone();
    assert!(eventually(WAIT, || transport.is_connected()).await);

    // Assert
    assert!(eventually(WAIT, || client.dropped_in_flight_message_ids() == vec![id]).await);
    assert!(client.in_flight_message_ids().is_empty());
    assert!(client.unpublished_message_ids().is_empty());
    gateway.stop().await.unwrap();
}
