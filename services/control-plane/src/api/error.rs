use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fleet_id::RequestId;
use serde::Serialize;

use crate::dispatch::DispatchError;
use crate::nodes::RegistryError;
use crate::scheduler::SchedulerError;
use crate::webhook::WebhookError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://fleet.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            request_id: RequestId::new().to_string(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        self.retryable = true;
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, code, message)
    }

    /// 503; the caller may retry after `seconds`.
    pub fn unavailable(code: impl Into<String>, message: impl Into<String>, seconds: u32) -> Self {
        let mut err = Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.problem.set_retry_after_seconds(seconds);
        err
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => ApiError::not_found("not_found", err.to_string()),
            RegistryError::InvalidToken
            | RegistryError::InvalidSecret
            | RegistryError::NotRegistered(_) => {
                ApiError::unauthorized("invalid_token", err.to_string())
            }
            RegistryError::NodeInUse { .. } => ApiError::conflict("node_in_use", err.to_string()),
            RegistryError::InvalidStatus(_) => {
                ApiError::bad_request("invalid_status", err.to_string())
            }
            RegistryError::Store(e) => {
                tracing::error!(error = %e, "Node registry storage failure");
                ApiError::internal("internal_error", "Failed to process node request")
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidCredentials => {
                ApiError::unauthorized("invalid_token", err.to_string())
            }
            DispatchError::Store(e) => {
                tracing::error!(error = %e, "Dispatch storage failure");
                ApiError::internal("internal_error", "Failed to open dispatch connection")
            }
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NotFound { .. } | SchedulerError::NotDeployed(_) => {
                ApiError::not_found("not_found", err.to_string())
            }
            SchedulerError::NoAvailableNodes { .. } => {
                ApiError::unavailable("capacity_exhausted", err.to_string(), 30)
            }
            SchedulerError::NodeUnreachable(_) => {
                ApiError::unavailable("node_unreachable", err.to_string(), 5)
            }
            SchedulerError::Suspended(_) => {
                ApiError::conflict("resource_suspended", err.to_string())
            }
            SchedulerError::InvalidInstances(_) => {
                ApiError::bad_request("invalid_instances", err.to_string())
            }
            SchedulerError::Registry(e) => e.into(),
            SchedulerError::Crypto(_)
            | SchedulerError::Payload(_)
            | SchedulerError::Dispatch(_)
            | SchedulerError::Store(_) => {
                tracing::error!(error = %err, "Scheduling failed");
                ApiError::internal("internal_error", "Failed to schedule task")
            }
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::AppNotFound(_) | WebhookError::NotConfigured(_) => {
                ApiError::not_found("not_found", err.to_string())
            }
            WebhookError::SignatureMismatch => {
                ApiError::unauthorized("signature_mismatch", err.to_string())
            }
            WebhookError::MissingEvent | WebhookError::InvalidPayload(_) => {
                ApiError::bad_request("invalid_webhook", err.to_string())
            }
            WebhookError::Scheduler(e) => e.into(),
            WebhookError::Crypto(_) | WebhookError::Store(_) => {
                tracing::error!(error = %err, "Webhook processing failed");
                ApiError::internal("internal_error", "Failed to process webhook")
            }
        }
    }
}
