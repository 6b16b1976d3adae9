use thiserror::Error;

use crate::api::ApiError;
use crate::storage::StorageError;

/// Errors surfaced by sign-in and other explicit session operations.
///
/// Refresh failures never show up here; they degrade to "signed out".
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Could not persist credentials: {0}")]
    Storage(#[from] StorageError),

    /// Credentials were rejected, or the grant was unusable
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl AuthError {
    /// Classify a failed `login` call.
    pub fn from_login_failure(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized | ApiError::AccessDenied(_) => {
                AuthError::Authentication("Invalid email or password".to_string())
            }
            ApiError::Rejected(message) => AuthError::Authentication(message),
            other => AuthError::Api(other),
        }
    }

    /// Message suitable for the sign-in form
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Authentication(message) => message.clone(),
            AuthError::Api(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            AuthError::Api(e) if e.is_connectivity() => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            AuthError::Api(e) => format!("Sign-in failed: {}", e),
            AuthError::Storage(_) => "Could not save your session on this device.".to_string(),
        }
    }
}
