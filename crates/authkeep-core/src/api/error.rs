//! Errors from the authentication endpoints.

use reqwest::StatusCode;
use thiserror::Error;

/// Error bodies longer than this are cut before they reach messages or logs.
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// 401: the bearer or refresh token is no longer accepted
    #[error("Credentials rejected by server")]
    Unauthorized,

    #[error("Endpoint not found: {0}")]
    NotFound(String),

    #[error("Too many requests, try again later")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Connectivity failure reported by something other than reqwest
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The server answered `{"success": false, "message": ...}`
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= ERROR_BODY_LIMIT {
            return body.to_string();
        }
        let cut = (0..=ERROR_BODY_LIMIT)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        format!("{}... ({} bytes)", &body[..cut], body.len())
    }

    /// Classify a non-success status. `body` is only used for context.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let body = Self::truncate_body(body);
        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => ApiError::AccessDenied(body),
            StatusCode::NOT_FOUND => ApiError::NotFound(body),
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            s if s.is_server_error() => ApiError::ServerError(body),
            s => ApiError::InvalidResponse(format!("unexpected status {}: {}", s, body)),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Network(e) if e.is_timeout())
    }

    /// The request never produced an answer from the server.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Transport(_))
    }
}
