//! Request/response dispatch over an application's control topics

use super::payload::{CloudletRequest, CloudletResponse};
use super::topic::{CloudletTopic, RequestMethod};
use crate::cloud::{CloudClient, CloudClientListener, CloudService};
use crate::config::CloudletSection;
use crate::error::{CloudError, CloudResult};
use crate::listeners::ListenerId;
use crate::observability::request_span;
use crate::outbound::REPLY_PRIORITY;
use crate::protocol::{CloudPayload, REPLY_TOPIC};
use crate::transport::Qos;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Worker pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudletOptions {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for CloudletOptions {
    fn default() -> Self {
        Self::from(&CloudletSection::default())
    }
}

impl From<&CloudletSection> for CloudletOptions {
    fn from(section: &CloudletSection) -> Self {
        Self {
            workers: section.workers.max(1),
            queue_depth: section.queue_depth.max(1),
        }
    }
}

/// Application logic behind a Cloudlet
///
/// Every method answers NotFound unless overridden. Returning
/// [`CloudError::BadRequest`] replies 400; any other error, or a panic,
/// replies 500 with the sanitized message attached.
#[async_trait]
#[allow(unused_variables)]
pub trait CloudletHandler: Send + Sync + 'static {
    async fn do_get(
        &self,
        topic: &CloudletTopic,
        request: &CloudletRequest,
    ) -> CloudResult<CloudletResponse> {
        Ok(CloudletResponse::not_found())
    }

    async fn do_put(
        &self,
        topic: &CloudletTopic,
        request: &CloudletRequest,
    ) -> CloudResult<CloudletResponse> {
        Ok(CloudletResponse::not_found())
    }

    async fn do_post(
        &self,
        topic: &CloudletTopic,
        request: &CloudletRequest,
    ) -> CloudResult<CloudletResponse> {
        Ok(CloudletResponse::not_found())
    }

    async fn do_del(
        &self,
        topic: &CloudletTopic,
        request: &CloudletRequest,
    ) -> CloudResult<CloudletResponse> {
        Ok(CloudletResponse::not_found())
    }

    async fn do_exec(
        &self,
        topic: &CloudletTopic,
        request: &CloudletRequest,
    ) -> CloudResult<CloudletResponse> {
        Ok(CloudletResponse::not_found())
    }
}

struct Job {
    topic: CloudletTopic,
    request: CloudletRequest,
}

/// Publish the reply for `request` on the requester's `REPLY/{requestId}`
fn send_reply(client: &CloudClient, request: &CloudletRequest, response: CloudletResponse) {
    let code = response.code;
    let app_topic = format!("{REPLY_TOPIC}/{}", request.request_id);
    let payload = response.into_payload().encode();

    match client.control_publish_to(
        &request.requester_client_id,
        &app_topic,
        payload,
        Qos::AtMostOnce,
        false,
        REPLY_PRIORITY,
    ) {
        Ok(message_id) => debug!(
            request_id = %request.request_id,
            requester = %request.requester_client_id,
            code = code.code(),
            message_id,
            "Reply queued"
        ),
        Err(e) => error!(
            request_id = %request.request_id,
            requester = %request.requester_client_id,
            error = %e,
            "Failed to queue reply"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn dispatch(handler: &dyn CloudletHandler, job: &Job) -> CloudletResponse {
    let Job { topic, request } = job;
    let call = async {
        match topic.method {
            RequestMethod::Get => handler.do_get(topic, request).await,
            RequestMethod::Put => handler.do_put(topic, request).await,
            RequestMethod::Post => handler.do_post(topic, request).await,
            RequestMethod::Del => handler.do_del(topic, request).await,
            RequestMethod::Exec => handler.do_exec(topic, request).await,
        }
    };

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(error = %e, "Handler failed");
            CloudletResponse::from_error(&e)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Handler panicked");
            CloudletResponse::from_panic(&message)
        }
    }
}

async fn run_worker(
    worker: usize,
    handler: Arc<dyn CloudletHandler>,
    client: Arc<CloudClient>,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        let span = request_span!(
            app_id = %client.app_id(),
            request_id = %job.request.request_id,
            requester = %job.request.requester_client_id,
            method = %job.topic.method,
            worker
        );
        async {
            debug!(resource = %job.topic.resource_path(), "Dispatching request");
            let response = dispatch(handler.as_ref(), &job).await;
            send_reply(&client, &job.request, response);
        }
        .instrument(span)
        .await;
    }
    debug!(app_id = %client.app_id(), worker, "Cloudlet worker stopped");
}

/// Turns control messages into jobs; runs on the delivering task
struct RequestListener {
    client: Weak<CloudClient>,
    jobs: mpsc::Sender<Job>,
}

impl CloudClientListener for RequestListener {
    fn on_control_message_arrived(
        &self,
        device_id: &str,
        app_topic: &str,
        payload: &[u8],
        _qos: Qos,
        _retained: bool,
    ) {
        if app_topic.starts_with(REPLY_TOPIC) {
            return;
        }
        let Some(client) = self.client.upgrade() else {
            return;
        };

        let request = match CloudletRequest::from_payload(CloudPayload::decode(payload)) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    app_id = %client.app_id(),
                    device_id = %device_id,
                    app_topic = %app_topic,
                    error = %e,
                    "Discarding request that cannot be answered"
                );
                return;
            }
        };

        let topic = match CloudletTopic::parse(app_topic) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(
                    app_id = %client.app_id(),
                    request_id = %request.request_id,
                    app_topic = %app_topic,
                    "Rejecting malformed request"
                );
                send_reply(&client, &request, CloudletResponse::from_error(&e));
                return;
            }
        };

        match self.jobs.try_send(Job { topic, request }) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                // Never drop a request; park it until a worker frees a slot
                debug!(request_id = %job.request.request_id, "Cloudlet queue full, deferring");
                let jobs = self.jobs.clone();
                tokio::spawn(async move {
                    if let Err(e) = jobs.send(job).await {
                        warn!(request_id = %e.0.request.request_id, "Cloudlet stopped before request was queued");
                    }
                });
            }
            Err(TrySendError::Closed(job)) => {
                warn!(request_id = %job.request.request_id, "Cloudlet stopped, request ignored");
            }
        }
    }
}

/// Serves `GET/PUT/POST/DEL/EXEC` requests for one application id
///
/// Requests arrive as control messages on the application's default
/// subscription. Each carries `request.id` and `requester.client.id`
/// metrics and is answered on the requester's `REPLY/{requestId}`.
pub struct Cloudlet {
    client: Arc<CloudClient>,
    listener_id: ListenerId,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Cloudlet {
    /// Create the application's client and start the workers
    pub async fn start(
        app_id: &str,
        cloud: &CloudService,
        handler: Arc<dyn CloudletHandler>,
        options: CloudletOptions,
    ) -> CloudResult<Self> {
        if options.workers == 0 || options.queue_depth == 0 {
            return Err(CloudError::invalid_configuration(
                "cloudlet workers and queue_depth must be positive",
            ));
        }

        let client = Arc::new(cloud.new_cloud_client(app_id).await?);
        let (tx, rx) = mpsc::channel(options.queue_depth);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..options.workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    handler.clone(),
                    client.clone(),
                    rx.clone(),
                ))
            })
            .collect();

        let listener_id = client.add_cloud_client_listener(Arc::new(RequestListener {
            client: Arc::downgrade(&client),
            jobs: tx,
        }));

        info!(
            app_id = %app_id,
            workers = options.workers,
            queue_depth = options.queue_depth,
            "Cloudlet started"
        );

        Ok(Self {
            client,
            listener_id,
            workers: Mutex::new(workers),
        })
    }

    pub fn app_id(&self) -> &str {
        self.client.app_id()
    }

    pub fn client(&self) -> &CloudClient {
        &self.client
    }

    /// Stop accepting requests, answer what is queued, then release the client
    pub async fn stop(&self) {
        // Dropping the listener drops the last long-lived job sender
        self.client.remove_cloud_client_listener(self.listener_id);

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(app_id = %self.client.app_id(), error = %e, "Cloudlet worker ended abnormally");
            }
        }

        self.client.release().await;
        info!(app_id = %self.client.app_id(), "Cloudlet stopped");
    }
}

impl Drop for Cloudlet {
    fn drop(&mut self) {
        let workers = self.workers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for worker in workers.drain(..) {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudlet::ResponseCode;

    struct Nothing;

    #[async_trait]
    impl CloudletHandler for Nothing {}

    fn job(method: &str) -> Job {
        Job {
            topic: CloudletTopic::parse(&format!("{method}/thing")).unwrap(),
            request: CloudletRequest::from_payload(
                CloudPayload::new()
                    .with_metric("request.id", "r1")
                    .with_metric("requester.client.id", "dev-1"),
            )
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_default_handler_answers_not_found() {
        for method in ["GET", "PUT", "POST", "DEL", "EXEC"] {
            let response = dispatch(&Nothing, &job(method)).await;
            assert_eq!(response.code, ResponseCode::NotFound);
        }
    }

    struct Exploding;

    #[async_trait]
    impl CloudletHandler for Exploding {
        async fn do_exec(
            &self,
            _topic: &CloudletTopic,
            _request: &CloudletRequest,
        ) -> CloudResult<CloudletResponse> {
            panic!("boom");
        }

        async fn do_put(
            &self,
            _topic: &CloudletTopic,
            _request: &CloudletRequest,
        ) -> CloudResult<CloudletResponse> {
            Err(CloudError::bad_request("missing value"))
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error_response() {
        let response = dispatch(&Exploding, &job("EXEC")).await;

        assert_eq!(response.code, ResponseCode::Error);
        assert!(response.exception_message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_bad_request_error_becomes_400() {
        let response = dispatch(&Exploding, &job("PUT")).await;
        assert_eq!(response.code, ResponseCode::BadRequest);
    }

    #[test]
    fn test_options_from_section_are_positive() {
        let options = CloudletOptions::from(&CloudletSection {
            workers: 0,
            queue_depth: 0,
        });
        assert_eq!(options.workers, 1);
        assert_eq!(options.queue_depth, 1);
    }
}
