use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::ApiError;

/// Tokens issued by sign-in or refresh.
///
/// `refresh_token` is optional because refresh responses may keep the
/// existing one; `expires_in` is in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
            expires_in: None,
        }
    }

    #[must_use]
    pub fn with_expires_in(mut self, secs: u64) -> Self {
        self.expires_in = Some(secs);
        self
    }
}

/// Profile returned by `GET /auth/me`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Network collaborator for the authentication endpoints.
pub trait AuthBackend: Send + Sync {
    /// Exchange a refresh token for a new grant (`POST /auth/refresh`)
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant, ApiError>>;

    /// Password sign-in (`POST /auth/login`)
    fn login<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, ApiError>>;

    /// Revoke the server-side session (`POST /auth/logout`)
    fn logout<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, Result<(), ApiError>>;

    /// Current user (`GET /auth/me`)
    fn fetch_profile<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, Result<UserProfile, ApiError>>;
}

/// Push-notification device registration, torn down on sign-out.
pub trait DeviceRegistry: Send + Sync {
    fn unregister<'a>(
        &'a self,
        access_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ApiError>>;
}
