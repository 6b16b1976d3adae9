//! Single-flight token refresh.
//!
//! However many callers find the access token stale at the same moment, only
//! one refresh request reaches the backend. The first caller creates a
//! ticket: a spawned refresh task wrapped in a `Shared` future. Everyone who
//! arrives while the ticket exists awaits a clone of it and receives the same
//! result. The task retires its own ticket when it finishes, whatever the
//! outcome, so the next stale read starts a fresh attempt.
//!
//! The ticket only writes or clears credentials if they are still the ones
//! it read. A sign-in or sign-out that lands while the request is in flight
//! wins, and the attempt reports `Superseded` instead.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::credentials::{CredentialRecord, CredentialStore, TokenPair};
use super::expiry::{Clock, ExpiryTimestamp};
use crate::api::{ApiError, AuthBackend};

/// Capacity of the refresh outcome broadcast channel.
/// Outcomes are rare (one per refresh attempt); 16 leaves room for slow listeners.
const OUTCOME_CHANNEL_CAPACITY: usize = 16;

/// Why a refresh attempt failed. Kept for logging only: every kind is
/// handled the same way (credentials cleared, caller gets no token).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh token is stored")]
    MissingRefreshToken,

    #[error("refresh request failed: {0}")]
    Network(String),

    #[error("refresh request timed out")]
    Timeout,

    #[error("refresh token rejected: {0}")]
    Rejected(String),

    #[error("malformed refresh response: {0}")]
    Malformed(String),

    #[error("could not access stored credentials: {0}")]
    Storage(String),
}

impl From<ApiError> for RefreshFailure {
    fn from(err: ApiError) -> Self {
        if err.is_timeout() {
            return RefreshFailure::Timeout;
        }
        match err {
            ApiError::Unauthorized => RefreshFailure::Rejected("unauthorized".to_string()),
            ApiError::AccessDenied(msg) | ApiError::Rejected(msg) => RefreshFailure::Rejected(msg),
            ApiError::InvalidResponse(msg) => RefreshFailure::Malformed(msg),
            other => RefreshFailure::Network(other.to_string()),
        }
    }
}

/// Published once per completed refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Credentials were cleared. `epoch` is the credential epoch the clear
    /// produced; a later sign-in moves past it.
    Failed { failure: RefreshFailure, epoch: u64 },
    /// A sign-in or sign-out replaced the credentials while the request was
    /// in flight, so its result was dropped and nothing was cleared.
    Superseded,
}

/// What one attempt did to storage.
enum Attempt {
    Refreshed(String),
    /// Another caller's refresh already landed; nothing was sent.
    AlreadyFresh(String),
    Superseded,
}

type Ticket = Shared<BoxFuture<'static, Option<String>>>;

#[derive(Default)]
struct TicketSlot {
    generation: u64,
    current: Option<(u64, Ticket)>,
}

struct Inner {
    credentials: Arc<CredentialStore>,
    backend: Arc<dyn AuthBackend>,
    clock: Arc<dyn Clock>,
    refresh_timeout: Duration,
    // Never held across an await.
    slot: Mutex<TicketSlot>,
    outcomes: broadcast::Sender<RefreshOutcome>,
}

/// Clears the ticket slot when the refresh task ends, even on panic.
struct RetireTicket {
    inner: Arc<Inner>,
    generation: u64,
}

impl Drop for RetireTicket {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slot.current, Some((generation, _)) if generation == self.generation) {
            slot.current = None;
        }
    }
}

/// Hands out valid access tokens, refreshing at most once at a time.
/// Clone is cheap and clones share the same in-flight ticket.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        credentials: Arc<CredentialStore>,
        backend: Arc<dyn AuthBackend>,
        clock: Arc<dyn Clock>,
        refresh_timeout: Duration,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                credentials,
                backend,
                clock,
                refresh_timeout,
                slot: Mutex::new(TicketSlot::default()),
                outcomes,
            }),
        }
    }

    /// Receive every refresh outcome from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Whether a refresh ticket is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .is_some()
    }

    /// Return a usable access token, or `None` if the caller must sign in.
    ///
    /// A fresh cached token is returned without suspending on the network.
    /// A stale one joins the in-flight refresh or starts it.
    pub async fn get_valid_token(&self) -> Option<String> {
        let record = match self.inner.credentials.read().await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read credentials, treating session as signed out");
                return None;
            }
        };

        if !record.is_stale(self.inner.clock.now()) {
            return Some(record.tokens.access_token);
        }

        debug!(expiry = ?record.expiry, "Access token is stale");
        self.join_or_start().await
    }

    fn join_or_start(&self) -> Ticket {
        let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((generation, ticket)) = &slot.current {
            debug!(generation, "Joining in-flight token refresh");
            return ticket.clone();
        }

        slot.generation += 1;
        let generation = slot.generation;
        debug!(generation, "Starting token refresh");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _retire = RetireTicket {
                inner: Arc::clone(&inner),
                generation,
            };
            inner.run_refresh().await
        });

        let ticket = task
            .map(|joined| match joined {
                Ok(token) => token,
                Err(e) => {
                    error!(error = %e, "Token refresh task did not complete");
                    None
                }
            })
            .boxed()
            .shared();

        slot.current = Some((generation, ticket.clone()));
        ticket
    }
}

impl Inner {
    /// One refresh attempt. A failure clears the stored credentials unless
    /// they were replaced while the request was running.
    async fn run_refresh(&self) -> Option<String> {
        let (current, epoch) = match self.credentials.read_versioned().await {
            Ok(versioned) => versioned,
            Err(e) => {
                let failure = RefreshFailure::Storage(e.to_string());
                warn!(error = %failure, "Token refresh failed, clearing credentials");
                let epoch = match self.credentials.clear().await {
                    Ok(epoch) => epoch,
                    Err(e) => {
                        error!(error = %e, "Failed to clear credentials after refresh failure");
                        self.credentials.epoch()
                    }
                };
                let _ = self.outcomes.send(RefreshOutcome::Failed { failure, epoch });
                return None;
            }
        };

        match self.refresh_once(current, epoch).await {
            Ok(Attempt::Refreshed(access_token)) => {
                let _ = self.outcomes.send(RefreshOutcome::Refreshed);
                Some(access_token)
            }
            Ok(Attempt::AlreadyFresh(access_token)) => Some(access_token),
            Ok(Attempt::Superseded) => self.after_superseded().await,
            Err(failure) => self.fail(failure, epoch).await,
        }
    }

    async fn fail(&self, failure: RefreshFailure, seen: u64) -> Option<String> {
        warn!(error = %failure, "Token refresh failed, clearing credentials");
        match self.credentials.clear_if_current(seen).await {
            Ok(Some(epoch)) => {
                let _ = self.outcomes.send(RefreshOutcome::Failed { failure, epoch });
                None
            }
            Ok(None) => self.after_superseded().await,
            Err(e) => {
                error!(error = %e, "Failed to clear credentials after refresh failure");
                let _ = self.outcomes.send(RefreshOutcome::Failed {
                    failure,
                    epoch: seen,
                });
                None
            }
        }
    }

    /// The credentials changed under the request. Hand out whatever is
    /// stored now if it is usable, without touching storage.
    async fn after_superseded(&self) -> Option<String> {
        debug!("Credentials replaced during refresh, discarding its result");
        let _ = self.outcomes.send(RefreshOutcome::Superseded);
        match self.credentials.read().await {
            Ok(Some(record)) if !record.is_stale(self.clock.now()) => Some(record.tokens.access_token),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read credentials");
                None
            }
        }
    }

    async fn refresh_once(
        &self,
        current: Option<CredentialRecord>,
        epoch: u64,
    ) -> Result<Attempt, RefreshFailure> {
        let current = current.ok_or(RefreshFailure::MissingRefreshToken)?;

        // A caller can see a stale record just before a previous ticket
        // stores its result and retires.
        if !current.is_stale(self.clock.now()) {
            debug!("Credentials already refreshed, skipping request");
            return Ok(Attempt::AlreadyFresh(current.tokens.access_token));
        }

        if current.tokens.refresh_token.is_empty() {
            return Err(RefreshFailure::MissingRefreshToken);
        }

        let grant = tokio::time::timeout(
            self.refresh_timeout,
            self.backend.refresh(&current.tokens.refresh_token),
        )
        .await
        .map_err(|_| RefreshFailure::Timeout)??;

        if grant.access_token.is_empty() {
            return Err(RefreshFailure::Malformed(
                "response did not include an access token".to_string(),
            ));
        }

        // Keep the old refresh token when the server does not rotate it.
        let refresh_token = grant
            .refresh_token
            .filter(|token| !token.is_empty())
            .unwrap_or(current.tokens.refresh_token);
        let expiry = ExpiryTimestamp::from_expires_in(self.clock.now(), grant.expires_in);
        let record = CredentialRecord::new(TokenPair::new(grant.access_token, refresh_token), Some(expiry));

        let stored = self
            .credentials
            .write_if_current(&record, epoch)
            .await
            .map_err(|e| RefreshFailure::Storage(e.to_string()))?;
        if stored.is_none() {
            return Ok(Attempt::Superseded);
        }

        info!(expires_at = %expiry, "Access token refreshed");
        Ok(Attempt::Refreshed(record.tokens.access_token))
    }
}
