use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::sync::broadcast;
use tracing::warn;

use super::credentials::{CredentialRecord, CredentialStore, TokenPair};
use super::expiry::{Clock, ExpiryTimestamp, SystemClock};
use super::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::api::{auth_headers, AuthBackend};
use crate::storage::{KeyValueStore, StorageError};

/// Token-level service: persisted credentials plus single-flight refresh.
///
/// Constructed once per process and shared behind an `Arc` with whatever
/// issues HTTP requests.
pub struct TokenManager {
    credentials: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        backend: Arc<dyn AuthBackend>,
        refresh_timeout: Duration,
    ) -> Self {
        Self::with_clock(storage, backend, refresh_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn KeyValueStore>,
        backend: Arc<dyn AuthBackend>,
        refresh_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let credentials = Arc::new(CredentialStore::new(storage));
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&credentials),
            backend,
            Arc::clone(&clock),
            refresh_timeout,
        );
        Self {
            credentials,
            coordinator,
            clock,
        }
    }

    /// Persist a freshly issued token pair. Expiry is `now + expires_in`
    /// (one hour when omitted).
    pub async fn store_tokens(
        &self,
        tokens: TokenPair,
        expires_in_secs: Option<u64>,
    ) -> Result<CredentialRecord, StorageError> {
        let expiry = ExpiryTimestamp::from_expires_in(self.clock.now(), expires_in_secs);
        let record = CredentialRecord::new(tokens, Some(expiry));
        self.credentials.write(&record).await?;
        Ok(record)
    }

    /// Current record, with read failures treated as absent.
    pub async fn record(&self) -> Option<CredentialRecord> {
        match self.credentials.read().await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to read credentials");
                None
            }
        }
    }

    /// Stored access token as-is, stale or not.
    pub async fn get_access_token(&self) -> Option<String> {
        self.record().await.map(|r| r.tokens.access_token)
    }

    pub async fn get_refresh_token(&self) -> Option<String> {
        self.record()
            .await
            .map(|r| r.tokens.refresh_token)
            .filter(|t| !t.is_empty())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.record().await.map(|r| r.authenticated).unwrap_or(false)
    }

    pub async fn clear_tokens(&self) -> Result<(), StorageError> {
        self.credentials.clear().await.map(|_| ())
    }

    /// Clear only if nothing stored or cleared credentials since `epoch`.
    /// Returns whether the record was removed.
    pub async fn clear_tokens_if_current(&self, epoch: u64) -> Result<bool, StorageError> {
        Ok(self.credentials.clear_if_current(epoch).await?.is_some())
    }

    /// Advances on every successful store or clear.
    pub fn credential_epoch(&self) -> u64 {
        self.credentials.epoch()
    }

    /// See [`RefreshCoordinator::get_valid_token`].
    pub async fn get_valid_token(&self) -> Option<String> {
        self.coordinator.get_valid_token().await
    }

    /// Headers for an outbound API request. Without a valid token only
    /// `Content-Type` is present.
    pub async fn auth_headers(&self) -> HeaderMap {
        let token = self.get_valid_token().await;
        auth_headers(token.as_deref())
    }

    pub fn subscribe_refresh(&self) -> broadcast::Receiver<RefreshOutcome> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }
}
