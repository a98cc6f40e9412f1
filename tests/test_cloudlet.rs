//! Cloudlet request/response tests
//!
//! Tests the request dispatch flow end to end over the mock broker:
//! - Method dispatch and replies on `REPLY/{requestId}`
//! - Malformed and unaddressable requests
//! - Handler errors and panics mapped to response codes
//! - Reply topics never treated as requests


use async_trait::async_trait;
use gateway_cloud::cloudlet::{
    Cloudlet, CloudletHandler, CloudletOptions, CloudletRequest, CloudletResponse,
    CloudletTopic, ResponseCode, METRIC_EXCEPTION_MESSAGE, METRIC_REQUESTER_CLIENT_ID,
    METRIC_REQUEST_ID,
};
use gateway_cloud::error::{CloudError, CloudResult};
use gateway_cloud::gateway::Gateway;
use gateway_cloud::protocol::CloudPayload;
use gateway_cloud::testing::mocks::{eventually, MockBrokerLink, MockLinkFactory, PublishedMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{mock_gateway, test_config, WAIT};

/// Serves `configurations` and `widgets/{id}`, and counts every call
#[derive(Default)]
struct ConfigurationHandler {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ConfigurationHandler {
    fn record(&self, topic: &CloudletTopic) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(topic.to_string());
    }
}

#[async_trait]
impl CloudletHandler for ConfigurationHandler {
    async fn do_get(
        &self,
        topic: &CloudletTopic,
        _request: &CloudletRequest,
    ) -> CloudResult<CloudletResponse> {
        self.record(topic);
        match topic.resource(0) {
            Some("configurations") => Ok(CloudletResponse::ok()
                .with_metric("configuration.count", 3)
                .with_body(b"<configurations/>".to_vec())),
            Some("widgets") => match topic.resource(1) {
                Some(widget_id) => Ok(CloudletResponse::ok()
                    .with_metric("widget.id", widget_id)
                    .with_metric("resource.path", topic.resource_path())),
                None => Err(CloudError::bad_request("widget id is required")),
            },
            _ => Ok(CloudletResponse::not_found()),
        }
    }

    async fn do_put(
        &self,
        topic: &CloudletTopic,
        request: &CloudletRequest,
    ) -> CloudResult<CloudletResponse> {
        self.record(topic);
        if request.body().is_none() {
            return Err(CloudError::bad_request("configuration body is required"));
        }
        Err(CloudError::internal_error("store unavailable, token=abc123"))
    }

    async fn do_exec(
        &self,
        topic: &CloudletTopic,
        _request: &CloudletRequest,
    ) -> CloudResult<CloudletResponse> {
        self.record(topic);
        panic!("reboot handler crashed");
    }
}

fn request(request_id: &str, requester: &str) -> CloudPayload {
    CloudPayload::new()
        .with_metric(METRIC_REQUEST_ID, request_id)
        .with_metric(METRIC_REQUESTER_CLIENT_ID, requester)
}

async fn started(
    handler: Arc<ConfigurationHandler>,
) -> (Gateway, Arc<MockLinkFactory>, Cloudlet) {
    let (gateway, factory) = mock_gateway(test_config());
    gateway.start();
    gateway.data().connect().await.unwrap();
    let cloudlet = Cloudlet::start(
        "CONF-V1",
        gateway.cloud(),
        handler,
        CloudletOptions {
            workers: 2,
            queue_depth: 4,
        },
    )
    .await
    .unwrap();
    (gateway, factory, cloudlet)
}

async fn reply_on(link: &MockBrokerLink, topic: &str) -> Option<PublishedMessage> {
    let found = eventually(WAIT, || link.published_topics().iter().any(|t| t == topic)).await;
    found
        .then(|| link.published().into_iter().find(|p| p.topic == topic))
        .flatten()
}

#[tokio::test]
async fn test_get_round_trip_replies_ok() {
    // Arrange
    let handler = Arc::new(ConfigurationHandler::default());
    let (gateway, factory, cloudlet) = started(handler.clone()).await;
    let link = factory.link();

    // Act
    link.deliver(
        "$EDC/acct/gw-test/CONF-V1/GET/configurations",
        request("r1", "dev-123").encode(),
    );

    // Assert
    let reply = reply_on(&link, "$EDC/acct/dev-123/CONF-V1/REPLY/r1")
        .await
        .expect("reply published");
    let payload = CloudPayload::decode(&reply.payload);
    assert_eq!(CloudletResponse::code_of(&payload), Some(ResponseCode::Ok));
    assert_eq!(payload.metric_str("configuration.count").as_deref(), Some("3"));
    assert_eq!(payload.body.as_deref(), Some(&b"<configurations/>"[..]));
    assert!(!reply.retain);
    assert_eq!(handler.seen.lock().unwrap().clone(), vec!["GET/configurations"]);

    cloudlet.stop().await;
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_get_widget_resolves_multi_segment_resource() {
    // Arrange
    let handler = Arc::new(ConfigurationHandler::default());
    let (gateway, factory, cloudlet) = started(handler.clone()).await;
    let link = factory.link();

    // Act
    link.deliver(
        "$EDC/acct/gw-test/CONF-V1/GET/widgets/42",
        request("w-42", "dev-123").encode(),
    );

    // Assert
    let reply = reply_on(&link, "$EDC/acct/dev-123/CONF-V1/REPLY/w-42")
        .await
        .expect("reply published");
    let payload = CloudPayload::decode(&reply.payload);
    assert_eq!(CloudletResponse::code_of(&payload), Some(ResponseCode::Ok));
    assert_eq!(payload.metric_str("widget.id").as_deref(), Some("42"));
    assert_eq!(payload.metric_str("resource.path").as_deref(), Some("widgets/42"));
    assert_eq!(handler.seen.lock().unwrap().clone(), vec!["GET/widgets/42"]);

    cloudlet.stop().await;
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_is_bad_request_without_handler_call() {
    // Arrange
    let handler = Arc::new(ConfigurationHandler::default());
    let (gateway, factory, cloudlet) = started(handler.clone()).await;
    let link = factory.link();

    // Act
    link.deliver("$EDC/acct/gw-test/CONF-V1/FOO/bar", request("r2", "dev-123").encode());

    // Assert
    let reply = reply_on(&link, "$EDC/acct/dev-123/CONF-V1/REPLY/r2")
        .await
        .expect("reply published");
    let payload = CloudPayload::decode(&reply.payload);
    assert_eq!(CloudletResponse::code_of(&payload), Some(ResponseCode::BadRequest));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    cloudlet.stop().await;
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_unhandled_method_is_not_found() {
    let handler = Arc::new(ConfigurationHandler::default());
    let (gateway, factory, cloudlet) = started(handler).await;
    let link = factory.link();

    link.deliver("$EDC/acct/gw-test/CONF-V1/DEL/configurations/1", request("r3", "dev-7").encode());

    let reply = reply_on(&link, "$EDC/acct/dev-7/CONF-V1/REPLY/r3")
        .await
        .expect("reply published");
    let payload = CloudPayload::decode(&reply.payload);
    assert_eq!(CloudletResponse::code_of(&payload), Some(ResponseCode::NotFound));

    cloudlet.stop().await;
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_errors_map_to_response_codes() {
    // Arrange
    let handler = Arc::new(ConfigurationHandler::default());
    let (gateway, factory, cloudlet) = started(handler).await;
    let link = factory.link();

    // Act
    link.deliver("$EDC/acct/gw-test/CONF-V1/PUT/configurations", request("r4", "dev-1").encode());
    link.deliver(
        "$EDC/acct/gw-test/CONF-V1/PUT/configurations",
        request("r5", "dev-1").with_body(b"<x/>".to_vec()).encode(),
    );
    link.deliver("$EDC/acct/gw-test/CONF-V1/EXEC/reboot", request("r6", "dev-1").encode());

    // Assert
    let missing_body = reply_on(&link, "$EDC/acct/dev-1/CONF-V1/REPLY/r4").await.unwrap();
    let failing = reply_on(&link, "$EDC/acct/dev-1/CONF-V1/REPLY/r5").await.unwrap();
    let panicking = reply_on(&link, "$EDC/acct/dev-1/CONF-V1/REPLY/r6").await.unwrap();

    let missing_body = CloudPayload::decode(&missing_body.payload);
    assert_eq!(CloudletResponse::code_of(&missing_body), Some(ResponseCode::BadRequest));

    let failing = CloudPayload::decode(&failing.payload);
    assert_eq!(CloudletResponse::code_of(&failing), Some(ResponseCode::Error));
    let message = failing.metric_str(METRIC_EXCEPTION_MESSAGE).unwrap();
    assert!(message.contains("store unavailable"));
    assert!(!message.contains("abc123"));

    let panicking = CloudPayload::decode(&panicking.payload);
    assert_eq!(CloudletResponse::code_of(&panicking), Some(ResponseCode::Error));

    cloudlet.stop().await;
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_requests_without_addressing_are_discarded() {
    let handler = Arc::new(ConfigurationHandler::default());
    let (gateway, factory, cloudlet) = started(handler.clone()).await;
    let link = factory.link();
    link.clear_history();

    let no_requester = CloudPayload::new().with_metric(METRIC_REQUEST_ID, "r7");
    link.deliver("$EDC/acct/gw-test/CONF-V1/GET/configurations", no_requester.encode());
    link.deliver("$EDC/acct/gw-test/CONF-V1/REPLY/r8", request("r8", "dev-1").encode());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert!(link
        .published_topics()
        .iter()
        .all(|topic| !topic.contains("/REPLY/")));

    cloudlet.stop().await;
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_burst_beyond_queue_depth_is_fully_answered() {
    // Arrange: 2 workers, queue depth 4
    let handler = Arc::new(ConfigurationHandler::default());
    let (gateway, factory, cloudlet) = started(handler.clone()).await;
    let link = factory.link();

    // Act
    for n in 0..20 {
        link.deliver(
            "$EDC/acct/gw-test/CONF-V1/GET/configurations",
            request(&format!("burst-{n}"), "dev-9").encode(),
        );
    }

    // Assert
    assert!(
        eventually(WAIT, || link
            .published_topics()
            .iter()
            .filter(|t| t.starts_with("$EDC/acct/dev-9/CONF-V1/REPLY/burst-"))
            .count()
            == 20)
        .await
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 20);

    cloudlet.stop().await;
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_releases_application() {
    let handler = Arc::new(ConfigurationHandler::default());
    let (gateway, _factory, cloudlet) = started(handler).await;
    assert_eq!(gateway.cloud().cloud_application_identifiers(), vec!["CONF-V1"]);

    cloudlet.stop().await;

    assert!(cloudlet.client().is_released());
    assert!(gateway.cloud().cloud_application_identifiers().is_empty());
    gateway.stop().await.unwrap();
}
