use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Request cancelled")]
    Cancelled,

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Session ended - please sign in again")]
    SessionEnded,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{}", rate_limit_message(.retry_after))]
    RateLimited { retry_after: Option<u64> },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// How a failure is recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Superseded or torn down; never user-visible
    Cancellation,
    /// Triggers renew-and-replay
    CredentialRejected,
    /// Retried with backoff
    Transient,
    /// Surfaced immediately
    Permanent,
    /// Requires re-authentication
    SessionEnded,
}

fn rate_limit_message(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!("Rate limit exceeded. Please try again in {} seconds.", secs),
        None => "Rate limited - please wait before retrying".to_string(),
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error payload shapes the backend uses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Prefer the server's own message over the raw body
    fn server_message(body: &str) -> String {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(ErrorBody { detail: Some(msg), .. }) | Ok(ErrorBody { error: Some(msg), .. }) => {
                Self::truncate_body(&msg)
            }
            _ => Self::truncate_body(body),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::server_message(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            400 | 409 | 422 => ApiError::BadRequest(message),
            429 => ApiError::RateLimited { retry_after: None },
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Cancelled => ErrorKind::Cancellation,
            ApiError::Unauthorized => ErrorKind::CredentialRejected,
            ApiError::SessionEnded => ErrorKind::SessionEnded,
            ApiError::RateLimited { .. } | ApiError::ServerError(_) | ApiError::NetworkError(_) => {
                ErrorKind::Transient
            }
            ApiError::AccessDenied(_)
            | ApiError::NotFound(_)
            | ApiError::BadRequest(_)
            | ApiError::InvalidResponse(_)
            | ApiError::InvalidToken(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::from_status(status, "")
        } else {
            ApiError::NetworkError(e.to_string())
        }
    }
}
