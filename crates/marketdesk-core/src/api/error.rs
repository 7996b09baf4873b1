use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected ({status}): {body}")]
    Validation { status: StatusCode, body: String },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Pulls a human-readable message out of a decoded error body.
type MessageExtractor = fn(&Value) -> Option<String>;

/// Error body shapes the backend has been seen to produce, most specific first.
const MESSAGE_EXTRACTORS: &[MessageExtractor] = &[
    detail_message,
    generic_message,
    title_message,
    api_error_message,
    raw_string_message,
];

fn detail_message(value: &Value) -> Option<String> {
    string_at(value, &["detail"])
}

fn generic_message(value: &Value) -> Option<String> {
    string_at(value, &["message"])
}

fn title_message(value: &Value) -> Option<String> {
    string_at(value, &["title"])
}

fn api_error_message(value: &Value) -> Option<String> {
    string_at(value, &["apiError", "errorMessage"])
}

fn raw_string_message(value: &Value) -> Option<String> {
    string_at(value, &[])
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized(truncated),
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            400..=499 => ApiError::Validation {
                status,
                body: truncated,
            },
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True for a plain 401 and for a session that could not be recovered.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_) | ApiError::SessionExpired(_))
    }

    /// Response body carried by the error, if a response was received.
    pub fn body(&self) -> Option<&str> {
        match self {
            ApiError::Unauthorized(body)
            | ApiError::AccessDenied(body)
            | ApiError::NotFound(body)
            | ApiError::ServerError(body)
            | ApiError::Validation { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Best-effort message for display, taken from the response body.
    pub fn user_message(&self) -> Option<String> {
        self.body().and_then(extract_message)
    }
}

/// Extract the most specific message from an error body.
///
/// JSON bodies are tried against each known shape in order; a body that is
/// not JSON at all is returned as-is when non-empty.
pub fn extract_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => MESSAGE_EXTRACTORS.iter().find_map(|extract| extract(&value)),
        Err(_) => Some(trimmed.to_string()),
    }
}
