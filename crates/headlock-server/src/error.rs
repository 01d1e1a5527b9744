//! HTTP mapping of coordinator errors

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use headlock_core::Error;
use serde::Serialize;

/// Error returned by route handlers
#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    BadRequest(String),
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) => match e {
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::AlreadyWaiting(_)
                | Error::NotWaiting(_)
                | Error::AlreadyActive(_)
                | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
                Error::TimedOut(_) => StatusCode::REQUEST_TIMEOUT,
                // The session was removed or the server is shutting down
                Error::Cancelled(_) => StatusCode::GONE,
                Error::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
                Error::Config(_) | Error::Io(_) | Error::Serialization(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            ApiError::BadRequest(message) => ErrorBody {
                error: "bad_request",
                message: message.clone(),
                session_id: None,
            },
            ApiError::Core(e) => ErrorBody {
                error: e.code(),
                message: e.to_string(),
                session_id: session_id(e).map(str::to_string),
            },
        }
    }
}

fn session_id(error: &Error) -> Option<&str> {
    match error {
        Error::NotFound(id)
        | Error::AlreadyWaiting(id)
        | Error::NotWaiting(id)
        | Error::AlreadyActive(id)
        | Error::TimedOut(id)
        | Error::Cancelled(id) => Some(id),
        Error::InvalidTransition { session_id, .. } => Some(session_id),
        _ => None,
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError::Core(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        }
        (status, Json(self.body())).into_response()
    }
}
