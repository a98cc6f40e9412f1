//! Request/response applications on top of a [`CloudClient`](crate::cloud::CloudClient)
//!
//! A Cloudlet receives `METHOD/resource/...` control messages, runs the
//! matching [`CloudletHandler`] method on a bounded worker pool and
//! publishes the result to the requester's `REPLY/{requestId}` topic.

pub mod dispatcher;
pub mod payload;
pub mod topic;

pub use dispatcher::{Cloudlet, CloudletHandler, CloudletOptions};
pub use payload::{
    CloudletRequest, CloudletResponse, ResponseCode, METRIC_EXCEPTION_MESSAGE,
    METRIC_EXCEPTION_STACK, METRIC_REQUESTER_CLIENT_ID, METRIC_REQUEST_ID, METRIC_RESPONSE_CODE,
};
pub use topic::{CloudletTopic, RequestMethod};
