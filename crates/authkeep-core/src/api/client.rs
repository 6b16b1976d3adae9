//! HTTP implementation of the authentication endpoints.
//!
//! Every endpoint answers with the same envelope:
//! `{"success": bool, "data": {...}, "message": "..."}`.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::backend::{AuthBackend, TokenGrant, UserProfile};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow mobile networks while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ApiError> {
        if !self.success {
            return Err(ApiError::Rejected(
                self.message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ));
        }
        self.data
            .ok_or_else(|| ApiError::InvalidResponse("response is missing `data`".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TokensData {
    tokens: TokenGrant,
}

#[derive(Debug, Deserialize)]
struct UserData {
    user: UserProfile,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Build outbound headers for an API request.
///
/// `Content-Type` is always present; `Authorization` only when a token is
/// supplied and is a valid header value.
pub fn auth_headers(access_token: Option<&str>) -> header::HeaderMap {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(JSON_CONTENT_TYPE),
    );
    if let Some(token) = access_token.filter(|t| !t.is_empty()) {
        match header::HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(value) => {
                headers.insert(header::AUTHORIZATION, value);
            }
            Err(_) => warn!("Access token is not a valid header value, sending request without it"),
        }
    }
    headers
}

/// reqwest-backed `AuthBackend`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
}

impl HttpAuthBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(Self::error_from_body(status, &body))
        }
    }

    /// Prefer the envelope's `message` over the raw body when the server sent one.
    fn error_from_body(status: reqwest::StatusCode, body: &str) -> ApiError {
        if status.is_client_error() && status.as_u16() != 429 {
            if let Ok(envelope) = serde_json::from_str::<Envelope<serde_json::Value>>(body) {
                if let Some(message) = envelope.message.filter(|_| !envelope.success) {
                    if status.as_u16() == 401 {
                        return ApiError::Unauthorized;
                    }
                    return ApiError::Rejected(message);
                }
            }
        }
        ApiError::from_status(status, body)
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let text = response.text().await?;
        let envelope: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("unexpected response shape: {e}")))?;
        envelope.into_data()
    }

    async fn post_for_tokens<B: Serialize>(&self, path: &str, body: &B) -> Result<TokenGrant, ApiError> {
        let url = self.url(path);
        debug!(url = %url, "POST");

        let response = self
            .client
            .post(&url)
            .headers(auth_headers(None))
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let data: TokensData = Self::parse(response).await?;
        Ok(data.tokens)
    }
}

impl AuthBackend for HttpAuthBackend {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant, ApiError>> {
        async move {
            self.post_for_tokens("/auth/refresh", &RefreshRequest { refresh_token })
                .await
        }
        .boxed()
    }

    fn login<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, ApiError>> {
        async move {
            self.post_for_tokens("/auth/login", &LoginRequest { email, password })
                .await
        }
        .boxed()
    }

    fn logout<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, Result<(), ApiError>> {
        async move {
            let response = self
                .client
                .post(self.url("/auth/logout"))
                .headers(auth_headers(Some(access_token)))
                .send()
                .await?;
            Self::check_response(response).await?;
            Ok(())
        }
        .boxed()
    }

    fn fetch_profile<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, Result<UserProfile, ApiError>> {
        async move {
            let response = self
                .client
                .get(self.url("/auth/me"))
                .headers(auth_headers(Some(access_token)))
                .send()
                .await?;
            let response = Self::check_response(response).await?;
            let data: UserData = Self::parse(response).await?;
            Ok(data.user)
        }
        .boxed()
    }
}
