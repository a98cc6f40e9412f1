//! Request and response envelopes exchanged by Cloudlets

use crate::error::{sanitize_error_message, CloudError, CloudResult};
use crate::protocol::CloudPayload;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

pub const METRIC_REQUEST_ID: &str = "request.id";
pub const METRIC_REQUESTER_CLIENT_ID: &str = "requester.client.id";
pub const METRIC_RESPONSE_CODE: &str = "response.code";
pub const METRIC_EXCEPTION_MESSAGE: &str = "response.exception.message";
pub const METRIC_EXCEPTION_STACK: &str = "response.exception.stack";

/// Reply status carried in `response.code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    BadRequest,
    NotFound,
    Error,
}

impl ResponseCode {
    pub fn code(self) -> u16 {
        match self {
            ResponseCode::Ok => 200,
            ResponseCode::BadRequest => 400,
            ResponseCode::NotFound => 404,
            ResponseCode::Error => 500,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(ResponseCode::Ok),
            400 => Some(ResponseCode::BadRequest),
            404 => Some(ResponseCode::NotFound),
            500 => Some(ResponseCode::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseCode::Ok => "OK",
            ResponseCode::BadRequest => "BAD_REQUEST",
            ResponseCode::NotFound => "NOTFOUND",
            ResponseCode::Error => "ERROR",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// An addressable request, alive for one dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct CloudletRequest {
    pub request_id: String,
    pub requester_client_id: String,
    pub received_at: DateTime<Utc>,
    pub payload: CloudPayload,
}

impl CloudletRequest {
    /// Requests must name both the request id and the requester
    pub fn from_payload(payload: CloudPayload) -> CloudResult<Self> {
        let request_id = payload
            .metric_str(METRIC_REQUEST_ID)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CloudError::bad_request("request without request.id"))?;
        let requester_client_id = payload
            .metric_str(METRIC_REQUESTER_CLIENT_ID)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CloudError::bad_request("request without requester.client.id"))?;

        Ok(Self {
            request_id,
            requester_client_id,
            received_at: Utc::now(),
            payload,
        })
    }

    pub fn metric(&self, name: &str) -> Option<&Value> {
        self.payload.metric(name)
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.payload.body.as_deref()
    }
}

/// Handler result, turned into the reply payload
#[derive(Debug, Clone, PartialEq)]
pub struct CloudletResponse {
    pub code: ResponseCode,
    pub exception_message: Option<String>,
    pub exception_stack: Option<String>,
    pub payload: CloudPayload,
}

impl CloudletResponse {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            exception_message: None,
            exception_stack: None,
            payload: CloudPayload::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(ResponseCode::Ok)
    }

    pub fn not_found() -> Self {
        Self::new(ResponseCode::NotFound)
    }

    pub fn with_metric(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.payload.add_metric(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.payload.body = Some(body.into());
        self
    }

    /// Reply for a failed handler; the detail is sanitized before it leaves
    pub fn from_error(error: &CloudError) -> Self {
        Self {
            exception_message: Some(error.exception_message()),
            exception_stack: Some(sanitize_error_message(&format!("{error:?}"))),
            ..Self::new(error.response_code())
        }
    }

    pub fn from_panic(message: &str) -> Self {
        Self {
            exception_message: Some(sanitize_error_message(&format!(
                "handler panicked: {message}"
            ))),
            ..Self::new(ResponseCode::Error)
        }
    }

    /// Envelope published on the reply topic
    pub fn into_payload(self) -> CloudPayload {
        let mut payload = self.payload;
        payload.timestamp = Utc::now();
        payload.add_metric(METRIC_RESPONSE_CODE, self.code.code());
        if let Some(message) = self.exception_message {
            payload.add_metric(METRIC_EXCEPTION_MESSAGE, message);
        }
        if let Some(stack) = self.exception_stack {
            payload.add_metric(METRIC_EXCEPTION_STACK, stack);
        }
        payload
    }

    /// Read the response code back from a reply envelope
    pub fn code_of(payload: &CloudPayload) -> Option<ResponseCode> {
        payload
            .metric(METRIC_RESPONSE_CODE)
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .and_then(ResponseCode::from_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_requires_id_and_requester() {
        let full = CloudPayload::new()
            .with_metric(METRIC_REQUEST_ID, "r1")
            .with_metric(METRIC_REQUESTER_CLIENT_ID, "dev-123");
        let request = CloudletRequest::from_payload(full).unwrap();
        assert_eq!(request.request_id, "r1");
        assert_eq!(request.requester_client_id, "dev-123");

        let no_requester = CloudPayload::new().with_metric(METRIC_REQUEST_ID, "r1");
        assert!(CloudletRequest::from_payload(no_requester).is_err());

        let empty_id = CloudPayload::new()
            .with_metric(METRIC_REQUEST_ID, "")
            .with_metric(METRIC_REQUESTER_CLIENT_ID, "dev-123");
        assert!(CloudletRequest::from_payload(empty_id).is_err());
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(ResponseCode::Ok.code(), 200);
        assert_eq!(ResponseCode::BadRequest.code(), 400);
        assert_eq!(ResponseCode::NotFound.code(), 404);
        assert_eq!(ResponseCode::Error.code(), 500);
        assert_eq!(ResponseCode::from_code(404), Some(ResponseCode::NotFound));
        assert_eq!(ResponseCode::from_code(201), None);
    }

    #[test]
    fn test_error_response_carries_sanitized_detail() {
        let error = CloudError::internal_error("db password=hunter2 unavailable");
        let payload = CloudletResponse::from_error(&error).into_payload();

        assert_eq!(CloudletResponse::code_of(&payload), Some(ResponseCode::Error));
        let message = payload.metric_str(METRIC_EXCEPTION_MESSAGE).unwrap();
        assert!(!message.contains("hunter2"));
        assert!(payload.metric(METRIC_EXCEPTION_STACK).is_some());
    }

    #[test]
    fn test_bad_request_maps_to_400() {
        let payload = CloudletResponse::from_error(&CloudError::bad_request("missing id")).into_payload();
        assert_eq!(payload.metric_str(METRIC_RESPONSE_CODE).as_deref(), Some("400"));
    }
}
