use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::expiry::{self, ExpiryTimestamp};
use crate::storage::{KeyValueStore, StorageError};

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const TOKEN_EXPIRY_KEY: &str = "tokenExpiry";
pub const IS_AUTHENTICATED_KEY: &str = "isAuthenticated";

/// Every key the credential record occupies; cleared together.
pub const CREDENTIAL_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    TOKEN_EXPIRY_KEY,
    IS_AUTHENTICATED_KEY,
];

/// Opaque bearer credentials. Never inspected for structure.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub tokens: TokenPair,
    pub expiry: Option<ExpiryTimestamp>,
    /// Only true when both tokens are non-empty.
    pub authenticated: bool,
}

impl CredentialRecord {
    pub fn new(tokens: TokenPair, expiry: Option<ExpiryTimestamp>) -> Self {
        let authenticated = !tokens.access_token.is_empty() && !tokens.refresh_token.is_empty();
        Self {
            tokens,
            expiry,
            authenticated,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        expiry::is_stale(self.expiry, now)
    }
}

/// The four credential fields kept in a [`KeyValueStore`].
///
/// Reads and writes go through one read/write lock, so a reader sees either
/// the whole previous record or the whole new one.
///
/// Every `write` and `clear` advances an epoch. Background work that read the
/// record at one epoch can use the `*_if_current` variants to avoid
/// clobbering a sign-in or sign-out that happened in the meantime.
pub struct CredentialStore {
    storage: Arc<dyn KeyValueStore>,
    io_lock: RwLock<()>,
    // Only advanced while `io_lock` is held for writing.
    epoch: AtomicU64,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            io_lock: RwLock::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Epoch of the most recent successful `write` or `clear`.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Load the record. `None` when nothing is stored or the access token is
    /// missing/empty.
    pub async fn read(&self) -> Result<Option<CredentialRecord>, StorageError> {
        Ok(self.read_versioned().await?.0)
    }

    /// Load the record together with the epoch it belongs to.
    pub async fn read_versioned(&self) -> Result<(Option<CredentialRecord>, u64), StorageError> {
        let _guard = self.io_lock.read().await;
        let epoch = self.epoch();
        Ok((self.read_fields().await?, epoch))
    }

    async fn read_fields(&self) -> Result<Option<CredentialRecord>, StorageError> {
        let access_token = match self.storage.get(ACCESS_TOKEN_KEY).await? {
            Some(token) if !token.is_empty() => token,
            _ => return Ok(None),
        };
        let refresh_token = self
            .storage
            .get(REFRESH_TOKEN_KEY)
            .await?
            .unwrap_or_default();
        let expiry = self
            .storage
            .get(TOKEN_EXPIRY_KEY)
            .await?
            .as_deref()
            .and_then(ExpiryTimestamp::parse);
        let flagged = self.storage.get(IS_AUTHENTICATED_KEY).await?.as_deref() == Some("true");

        let mut record = CredentialRecord::new(TokenPair::new(access_token, refresh_token), expiry);
        record.authenticated &= flagged;
        Ok(Some(record))
    }

    /// Overwrite all four fields.
    ///
    /// If any field fails to persist, the remaining fields are removed so a
    /// partial record is never left behind, and the error is returned.
    pub async fn write(&self, record: &CredentialRecord) -> Result<u64, StorageError> {
        let _guard = self.io_lock.write().await;
        self.write_locked(record).await
    }

    /// Like [`write`](Self::write), but only if nothing has written or
    /// cleared the record since `expected`. Returns the new epoch, or `None`
    /// when the record was superseded and left untouched.
    pub async fn write_if_current(
        &self,
        record: &CredentialRecord,
        expected: u64,
    ) -> Result<Option<u64>, StorageError> {
        let _guard = self.io_lock.write().await;
        if self.epoch() != expected {
            debug!(expected, current = self.epoch(), "Credentials changed, skipping write");
            return Ok(None);
        }
        self.write_locked(record).await.map(Some)
    }

    async fn write_locked(&self, record: &CredentialRecord) -> Result<u64, StorageError> {
        if let Err(e) = self.write_fields(record).await {
            warn!(error = %e, "Credential write failed, discarding partial record");
            if let Err(clear_err) = self.storage.remove(&CREDENTIAL_KEYS).await {
                warn!(error = %clear_err, "Failed to discard partial credential record");
            }
            return Err(e);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(expiry = ?record.expiry, epoch, "Credentials stored");
        Ok(epoch)
    }

    async fn write_fields(&self, record: &CredentialRecord) -> Result<(), StorageError> {
        self.storage
            .set(ACCESS_TOKEN_KEY, &record.tokens.access_token)
            .await?;
        self.storage
            .set(REFRESH_TOKEN_KEY, &record.tokens.refresh_token)
            .await?;
        match record.expiry {
            Some(expiry) => {
                self.storage
                    .set(TOKEN_EXPIRY_KEY, &expiry.to_string())
                    .await?
            }
            None => self.storage.remove(&[TOKEN_EXPIRY_KEY]).await?,
        }
        if record.authenticated {
            self.storage.set(IS_AUTHENTICATED_KEY, "true").await
        } else {
            self.storage.remove(&[IS_AUTHENTICATED_KEY]).await
        }
    }

    /// Remove all four fields in one storage call.
    pub async fn clear(&self) -> Result<u64, StorageError> {
        let _guard = self.io_lock.write().await;
        self.clear_locked().await
    }

    /// Clear only if the record is still the one read at `expected`.
    /// `None` means a newer write or clear won and nothing was removed.
    pub async fn clear_if_current(&self, expected: u64) -> Result<Option<u64>, StorageError> {
        let _guard = self.io_lock.write().await;
        if self.epoch() != expected {
            debug!(expected, current = self.epoch(), "Credentials changed, skipping clear");
            return Ok(None);
        }
        self.clear_locked().await.map(Some)
    }

    async fn clear_locked(&self) -> Result<u64, StorageError> {
        self.storage.remove(&CREDENTIAL_KEYS).await?;
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(epoch, "Credentials cleared");
        Ok(epoch)
    }
}
