//! Kernel error kinds and their HTTP mapping.
//!
//! Every error is local-recoverable: handlers turn them into a JSON error body,
//! background tasks log them and keep running.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invalid produce type: {0}")]
    InvalidProduceType(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed metrics sample: {0}")]
    MalformedSample(String),
    #[error("classification unavailable: {0}")]
    ClassificationUnavailable(String),
    #[error("notification delivery failed: {0}")]
    NotificationDeliveryFailed(String),
    #[error("invalid request body: {0}")]
    InvalidRequest(String),
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
    #[error("unknown actuator channel: {0}")]
    UnknownChannel(String),
    #[error("channel {0} is not operator-controllable")]
    ChannelNotControllable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl KernelError {
    pub fn status(&self) -> StatusCode {
        match self {
            KernelError::InvalidProduceType(_)
            | KernelError::MalformedSample(_)
            | KernelError::InvalidUpload(_)
            | KernelError::InvalidRequest(_)
            | KernelError::UnknownChannel(_) => StatusCode::BAD_REQUEST,
            KernelError::NotFound(_) => StatusCode::NOT_FOUND,
            KernelError::ChannelNotControllable(_) => StatusCode::CONFLICT,
            KernelError::ClassificationUnavailable(_)
            | KernelError::NotificationDeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            KernelError::Io(_) | KernelError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for KernelError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "ok": false, "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
