//! HKP status model.
//!
//! Every HKP handler resolves to a [`Status`]: an HTTP code, a message and
//! an error flag. Successful statuses render as `message\n` in plain text;
//! errors and `202 Accepted` render as a JSON envelope so that clients can
//! automate on a stable shape:
//!
//! ```json
//! {"error":{"code":409,"message":"Duplicate key"}}
//! ```

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// JSON body emitted for errors and pending (202) outcomes.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error description with HTTP code and message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

/// Outcome of an HKP operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
    is_error: bool,
}

impl Status {
    /// Build a status from a code, an error flag and message parts.
    ///
    /// An empty part list falls back to the canonical HTTP reason phrase;
    /// multiple parts are joined with `": "`.
    pub fn new(code: StatusCode, is_error: bool, message: &[&str]) -> Self {
        let message = if message.is_empty() {
            code.canonical_reason().unwrap_or_default().to_string()
        } else {
            message.join(": ")
        };
        Status {
            code,
            message,
            is_error,
        }
    }

    pub fn ok(message: &[&str]) -> Self {
        Status::new(StatusCode::OK, false, message)
    }

    pub fn accepted(message: &[&str]) -> Self {
        Status::new(StatusCode::ACCEPTED, false, message)
    }

    pub fn bad_request(message: &[&str]) -> Self {
        Status::new(StatusCode::BAD_REQUEST, true, message)
    }

    pub fn forbidden(message: &[&str]) -> Self {
        Status::new(StatusCode::FORBIDDEN, true, message)
    }

    pub fn method_not_allowed(message: &[&str]) -> Self {
        Status::new(StatusCode::METHOD_NOT_ALLOWED, true, message)
    }

    pub fn not_implemented(message: &[&str]) -> Self {
        Status::new(StatusCode::NOT_IMPLEMENTED, true, message)
    }

    pub fn conflict(message: &[&str]) -> Self {
        Status::new(StatusCode::CONFLICT, true, message)
    }

    pub fn internal_server_error(message: &[&str]) -> Self {
        Status::new(StatusCode::INTERNAL_SERVER_ERROR, true, message)
    }

    pub fn not_found(message: &[&str]) -> Self {
        Status::new(StatusCode::NOT_FOUND, true, message)
    }

    pub fn too_many_requests(message: &[&str]) -> Self {
        Status::new(StatusCode::TOO_MANY_REQUESTS, true, message)
    }

    /// Does this status carry the given HTTP code?
    pub fn is(&self, code: u16) -> bool {
        self.code.as_u16() == code
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for Status {
    fn into_response(self) -> Response {
        if self.is_error || self.code == StatusCode::ACCEPTED {
            let body = ErrorResponse {
                error: ErrorBody {
                    code: self.code.as_u16(),
                    message: self.message,
                },
            };
            (
                self.code,
                [(header::CONTENT_TYPE, "application/json")],
                axum::Json(body),
            )
                .into_response()
        } else {
            (self.code, format!("{}\n", self.message)).into_response()
        }
    }
}
