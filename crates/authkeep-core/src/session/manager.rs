use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::machine::{transition, SessionEvent, SessionPhase, SessionState};
use crate::api::{ApiError, AuthBackend, DeviceRegistry, TokenGrant, UserProfile};
use crate::auth::{RefreshOutcome, TokenManager, TokenPair};
use crate::config::SessionConfig;
use crate::error::AuthError;

/// Result of the startup probe, applied only if initialization is still pending.
#[derive(Debug)]
enum Probe {
    Authenticated(Option<UserProfile>),
    Unauthenticated,
}

/// A best-effort sign-out step that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffectFailure {
    pub task: &'static str,
    pub error: String,
}

/// Handles to the background work spawned by sign-out.
///
/// Dropping this detaches the tasks; they still run to completion and log
/// their own failures.
#[derive(Debug, Default)]
pub struct SideEffects {
    tasks: Vec<(&'static str, JoinHandle<Result<(), ApiError>>)>,
}

impl SideEffects {
    fn spawn<F>(&mut self, task: &'static str, work: F)
    where
        F: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let result = work.await;
            if let Err(ref e) = result {
                warn!(task, error = %e, "Best-effort sign-out step failed");
            }
            result
        });
        self.tasks.push((task, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every side effect and collect the ones that failed.
    pub async fn join(self) -> Vec<SideEffectFailure> {
        let mut failures = Vec::new();
        for (task, handle) in self.tasks {
            let error = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("task did not complete: {e}"),
            };
            failures.push(SideEffectFailure { task, error });
        }
        failures
    }
}

/// Owns the session state machine and drives it from startup, sign-in,
/// sign-out and refresh outcomes.
///
/// Must be created inside a tokio runtime: construction spawns the listener
/// that turns refresh failures into `Unauthenticated`.
pub struct SessionManager {
    tokens: Arc<TokenManager>,
    backend: Arc<dyn AuthBackend>,
    devices: Option<Arc<dyn DeviceRegistry>>,
    config: SessionConfig,
    state: Arc<watch::Sender<SessionState>>,
    profile: RwLock<Option<UserProfile>>,
    refresh_listener: JoinHandle<()>,
}

impl SessionManager {
    pub fn new(
        tokens: Arc<TokenManager>,
        backend: Arc<dyn AuthBackend>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::new());
        let state = Arc::new(state);
        let refresh_listener = tokio::spawn(listen_for_refresh_failures(
            tokens.subscribe_refresh(),
            Arc::clone(&tokens),
            Arc::clone(&state),
        ));

        Self {
            tokens,
            backend,
            devices: None,
            config,
            state,
            profile: RwLock::new(None),
            refresh_listener,
        }
    }

    /// Unregister this push device on sign-out.
    #[must_use]
    pub fn with_device_registry(mut self, devices: Arc<dyn DeviceRegistry>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn apply(&self, event: SessionEvent) -> (bool, SessionState) {
        apply_event(&self.state, event)
    }

    fn set_profile(&self, profile: Option<UserProfile>) {
        *self.profile.write().unwrap_or_else(PoisonError::into_inner) = profile;
    }

    /// Resolve the startup phase.
    ///
    /// Never stays `Initializing` longer than the configured bound: if the
    /// probe has not finished by then the session falls back to
    /// `Unauthenticated`, and the probe's eventual result is discarded.
    pub async fn initialize(&self) -> SessionState {
        let (started, state) = self.apply(SessionEvent::InitializationStarted);
        if !started {
            debug!(phase = ?state.phase, "Session already initialized");
            return state;
        }

        let probe = tokio::spawn(probe_session(
            Arc::clone(&self.tokens),
            Arc::clone(&self.backend),
        ));

        match tokio::time::timeout(self.config.init_timeout, probe).await {
            Ok(Ok(Probe::Authenticated(profile))) => {
                let (changed, state) = self.apply(SessionEvent::ProbeSucceeded);
                if changed {
                    self.set_profile(profile);
                }
                state
            }
            Ok(Ok(Probe::Unauthenticated)) => self.apply(SessionEvent::ProbeFailed).1,
            Ok(Err(e)) => {
                error!(error = %e, "Session probe crashed");
                self.apply(SessionEvent::Failed(format!("Session initialization failed: {e}")))
                    .1
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.init_timeout.as_millis() as u64,
                    "Session initialization timed out, continuing signed out"
                );
                self.apply(SessionEvent::InitializationTimedOut).1
            }
        }
    }

    /// Store a grant from a completed sign-in and become `Authenticated`.
    /// No refresh is involved.
    ///
    /// The grant must carry both tokens; anything less could never be
    /// refreshed and would not read back as authenticated.
    pub async fn sign_in(&self, grant: TokenGrant) -> Result<SessionState, AuthError> {
        let missing = if grant.access_token.is_empty() {
            Some("an access token")
        } else if grant.refresh_token.as_deref().map_or(true, str::is_empty) {
            Some("a refresh token")
        } else {
            None
        };
        if let Some(what) = missing {
            let err = AuthError::Authentication(format!(
                "Sign-in response did not include {what}"
            ));
            warn!(error = %err, "Unusable sign-in grant");
            self.apply(SessionEvent::Failed(err.user_message()));
            return Err(err);
        }

        let tokens = TokenPair::new(grant.access_token, grant.refresh_token.unwrap_or_default());
        match self.tokens.store_tokens(tokens, grant.expires_in).await {
            Ok(_) => {
                info!("Signed in");
                Ok(self.apply(SessionEvent::SignedIn).1)
            }
            Err(e) => {
                error!(error = %e, "Failed to store credentials after sign-in");
                let err = AuthError::Storage(e);
                self.apply(SessionEvent::Failed(err.user_message()));
                Err(err)
            }
        }
    }

    /// Password sign-in through the backend, then [`sign_in`](Self::sign_in).
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SessionState, AuthError> {
        let grant = match self.backend.login(email, password).await {
            Ok(grant) => grant,
            Err(e) => {
                let err = AuthError::from_login_failure(e);
                warn!(error = %err, "Sign-in failed");
                self.apply(SessionEvent::Failed(err.user_message()));
                return Err(err);
            }
        };

        let access_token = grant.access_token.clone();
        let state = self.sign_in(grant).await?;

        match self.backend.fetch_profile(&access_token).await {
            Ok(profile) => self.set_profile(Some(profile)),
            Err(e) => warn!(error = %e, "Could not load profile after sign-in"),
        }
        Ok(state)
    }

    /// Sign out locally, then revoke the server session and unregister the
    /// push device in the background.
    ///
    /// The local transition always happens, even if clearing storage or any
    /// background step fails.
    pub async fn sign_out(&self) -> SideEffects {
        let access_token = self.tokens.get_access_token().await;

        if let Err(e) = self.tokens.clear_tokens().await {
            warn!(error = %e, "Failed to clear credentials during sign-out");
        }
        self.set_profile(None);
        self.apply(SessionEvent::SignedOut);
        info!("Signed out");

        let mut effects = SideEffects::default();
        if let Some(token) = access_token.clone() {
            let backend = Arc::clone(&self.backend);
            effects.spawn("server logout", async move { backend.logout(&token).await });
        }
        if let Some(devices) = &self.devices {
            let devices = Arc::clone(devices);
            effects.spawn("push unregistration", async move {
                devices.unregister(access_token.as_deref()).await
            });
        }
        effects
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.refresh_listener.abort();
    }
}

fn apply_event(state: &watch::Sender<SessionState>, event: SessionEvent) -> (bool, SessionState) {
    apply_event_when(state, event, || true)
}

/// Apply `event` only if `still_applies` holds, checked while the state is
/// locked so it cannot interleave with another transition.
fn apply_event_when(
    state: &watch::Sender<SessionState>,
    event: SessionEvent,
    still_applies: impl FnOnce() -> bool,
) -> (bool, SessionState) {
    let changed = state.send_if_modified(|current| {
        if !still_applies() {
            return false;
        }
        let next = transition(current, event);
        if next == *current {
            return false;
        }
        info!(from = current.phase.as_str(), to = next.phase.as_str(), "Session transition");
        *current = next;
        true
    });
    (changed, state.borrow().clone())
}

async fn listen_for_refresh_failures(
    mut outcomes: broadcast::Receiver<RefreshOutcome>,
    tokens: Arc<TokenManager>,
    state: Arc<watch::Sender<SessionState>>,
) {
    loop {
        match outcomes.recv().await {
            Ok(RefreshOutcome::Failed { failure, epoch }) => {
                // A sign-in stored newer credentials after this failure
                let (applied, _) = apply_event_when(&state, SessionEvent::RefreshFailed, || {
                    tokens.credential_epoch() == epoch
                });
                if applied {
                    debug!(error = %failure, "Refresh failed, session ended");
                } else {
                    debug!(error = %failure, epoch, "Ignoring refresh failure for replaced credentials");
                }
            }
            Ok(RefreshOutcome::Refreshed | RefreshOutcome::Superseded) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Refresh outcome listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Decide the startup phase from stored credentials.
async fn probe_session(tokens: Arc<TokenManager>, backend: Arc<dyn AuthBackend>) -> Probe {
    if tokens.record().await.is_none() {
        debug!("No stored credentials");
        return Probe::Unauthenticated;
    }

    let Some(access_token) = tokens.get_valid_token().await else {
        debug!("Stored credentials could not produce a valid token");
        return Probe::Unauthenticated;
    };
    let epoch = tokens.credential_epoch();

    match backend.fetch_profile(&access_token).await {
        Ok(profile) => Probe::Authenticated(Some(profile)),
        Err(e) if e.is_unauthorized() => {
            warn!("Stored session was rejected by the server");
            // Leave a sign-in that raced the probe alone
            if let Err(e) = tokens.clear_tokens_if_current(epoch).await {
                warn!(error = %e, "Failed to clear rejected credentials");
            }
            Probe::Unauthenticated
        }
        Err(e) => {
            // The token itself is valid; the profile can be loaded later.
            warn!(error = %e, "Profile probe failed, keeping stored session");
            Probe::Authenticated(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::auth::ExpiryTimestamp;
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::testing::{
        profile, BrokenStore, FixedClock, HangingStore, MockBackend, MockDevices, Reply,
    };

    const NOW_MS: i64 = 1_700_000_000_000;

    fn session_with(
        storage: Arc<dyn KeyValueStore>,
        backend: MockBackend,
    ) -> (Arc<MockBackend>, SessionManager) {
        let backend = Arc::new(backend);
        let tokens = Arc::new(TokenManager::with_clock(
            storage,
            backend.clone(),
            Duration::from_secs(30),
            Arc::new(FixedClock::at_millis(NOW_MS)),
        ));
        let manager = SessionManager::new(tokens, backend.clone(), SessionConfig::default());
        (backend, manager)
    }

    async fn stored(expires_in: u64) -> Arc<MemoryStore> {
        let storage = Arc::new(MemoryStore::new());
        let seed = TokenManager::with_clock(
            storage.clone(),
            Arc::new(MockBackend::new()),
            Duration::from_secs(30),
            Arc::new(FixedClock::at_millis(NOW_MS)),
        );
        seed.store_tokens(TokenPair::new("A1", "R1"), Some(expires_in))
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn test_initialize_without_credentials() {
        let (backend, manager) = session_with(Arc::new(MemoryStore::new()), MockBackend::new());
        assert_eq!(manager.state().phase, SessionPhase::Uninitialized);

        let state = manager.initialize().await;
        assert_eq!(state.phase, SessionPhase::Unauthenticated);
        assert_eq!(backend.profile_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_initialize_with_valid_credentials() {
        let (_, manager) = session_with(
            stored(3600).await,
            MockBackend::new().on_profile(Reply::Ok(profile("u-1"))),
        );

        let state = manager.initialize().await;
        assert_eq!(state.phase, SessionPhase::Authenticated);
        assert_eq!(manager.current_user().unwrap().id, "u-1");
    }

    #[tokio::test]
    async fn test_initialize_refreshes_stale_credentials() {
        let (backend, manager) = session_with(
            stored(60).await,
            MockBackend::new()
                .on_refresh(Reply::Ok(TokenGrant::new("A2", "R2")))
                .on_profile(Reply::Ok(profile("u-1"))),
        );

        assert_eq!(manager.initialize().await.phase, SessionPhase::Authenticated);
        assert_eq!(backend.refresh_count(), 1);
        assert_eq!(manager.tokens().get_access_token().await.as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_initialize_with_rejected_refresh() {
        let (_, manager) = session_with(
            stored(60).await,
            MockBackend::new().on_refresh(Reply::Err(ApiError::Unauthorized)),
        );

        assert_eq!(manager.initialize().await.phase, SessionPhase::Unauthenticated);
        assert!(!manager.tokens().is_authenticated().await);
    }

    #[tokio::test]
    async fn test_initialize_with_revoked_session() {
        let (_, manager) = session_with(
            stored(3600).await,
            MockBackend::new().on_profile(Reply::Err(ApiError::Unauthorized)),
        );

        assert_eq!(manager.initialize().await.phase, SessionPhase::Unauthenticated);
        assert_eq!(manager.tokens().record().await, None);
    }

    #[tokio::test]
    async fn test_initialize_keeps_session_when_profile_unreachable() {
        let (_, manager) = session_with(
            stored(3600).await,
            MockBackend::new().on_profile(Reply::Err(ApiError::Transport("offline".into()))),
        );

        assert_eq!(manager.initialize().await.phase, SessionPhase::Authenticated);
        assert_eq!(manager.current_user(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_is_bounded_when_storage_hangs() {
        let (_, manager) = session_with(Arc::new(HangingStore), MockBackend::new());
        let started = tokio::time::Instant::now();

        let state = manager.initialize().await;

        assert_eq!(state.phase, SessionPhase::Unauthenticated);
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_is_bounded_when_network_hangs() {
        let (backend, manager) =
            session_with(stored(60).await, MockBackend::new().on_refresh(Reply::Hang));

        let state = manager.initialize().await;
        assert_eq!(state.phase, SessionPhase::Unauthenticated);

        // The refresh keeps running after the bound and later times out on its own
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.state().phase, SessionPhase::Unauthenticated);
        assert_eq!(backend.refresh_count(), 1);
        assert!(!manager.tokens().is_authenticated().await);
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let (backend, manager) = session_with(
            stored(3600).await,
            MockBackend::new().on_profile(Reply::Ok(profile("u-1"))),
        );
        manager.initialize().await;
        manager.initialize().await;
        assert_eq!(backend.profile_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_in_stores_without_refresh() {
        let (backend, manager) = session_with(Arc::new(MemoryStore::new()), MockBackend::new());
        manager.initialize().await;

        let state = manager
            .sign_in(TokenGrant::new("A1", "R1").with_expires_in(3600))
            .await
            .unwrap();

        assert_eq!(state.phase, SessionPhase::Authenticated);
        assert_eq!(manager.tokens().get_valid_token().await.as_deref(), Some("A1"));
        assert_eq!(backend.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_sign_in_storage_failure_is_error() {
        let (_, manager) = session_with(Arc::new(BrokenStore), MockBackend::new());
        manager.initialize().await;

        let result = manager.sign_in(TokenGrant::new("A1", "R1")).await;

        assert!(matches!(result, Err(AuthError::Storage(_))));
        let state = manager.state();
        assert_eq!(state.phase, SessionPhase::Error);
        assert!(state.error_message.is_some());
    }

    #[tokio::test]
    async fn test_password_sign_in_rejected_then_recovers() {
        let (_, manager) = session_with(
            Arc::new(MemoryStore::new()),
            MockBackend::new()
                .on_login(Reply::Err(ApiError::Unauthorized))
                .on_login(Reply::Ok(TokenGrant::new("A1", "R1")))
                .on_profile(Reply::Ok(profile("u-7"))),
        );
        manager.initialize().await;

        let err = manager
            .sign_in_with_password("sam@example.com", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
        assert_eq!(manager.state().phase, SessionPhase::Error);
        assert_eq!(
            manager.state().error_message.as_deref(),
            Some("Invalid email or password")
        );

        let state = manager
            .sign_in_with_password("sam@example.com", "right")
            .await
            .unwrap();
        assert_eq!(state.phase, SessionPhase::Authenticated);
        assert_eq!(manager.current_user().unwrap().id, "u-7");
    }

    #[tokio::test]
    async fn test_sign_out_runs_side_effects() {
        let devices = Arc::new(MockDevices::default());
        let (backend, manager) = session_with(
            stored(3600).await,
            MockBackend::new()
                .on_profile(Reply::Ok(profile("u-1")))
                .on_logout(Reply::Ok(())),
        );
        let manager = manager.with_device_registry(devices.clone());
        manager.initialize().await;

        let effects = manager.sign_out().await;

        assert_eq!(manager.state().phase, SessionPhase::Unauthenticated);
        assert!(!manager.tokens().is_authenticated().await);
        assert_eq!(manager.current_user(), None);
        assert_eq!(effects.len(), 2);
        assert!(effects.join().await.is_empty());
        assert_eq!(backend.logout_calls.load(Ordering::SeqCst), 1);
        assert_eq!(devices.unregister_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_out_side_effect_failures_do_not_block() {
        let devices = Arc::new(MockDevices {
            fail: true,
            ..MockDevices::default()
        });
        let (_, manager) = session_with(
            stored(3600).await,
            MockBackend::new()
                .on_profile(Reply::Ok(profile("u-1")))
                .on_logout(Reply::Err(ApiError::ServerError("down".into()))),
        );
        let manager = manager.with_device_registry(devices);
        manager.initialize().await;

        let effects = manager.sign_out().await;
        assert_eq!(manager.state().phase, SessionPhase::Unauthenticated);

        let failures = effects.join().await;
        let tasks: Vec<_> = failures.iter().map(|f| f.task).collect();
        assert_eq!(tasks, vec!["server logout", "push unregistration"]);
    }

    #[tokio::test]
    async fn test_sign_out_without_token_skips_server_logout() {
        let (backend, manager) = session_with(Arc::new(MemoryStore::new()), MockBackend::new());
        manager.initialize().await;

        let effects = manager.sign_out().await;

        assert!(effects.is_empty());
        assert_eq!(manager.state().phase, SessionPhase::Unauthenticated);
        assert_eq!(backend.logout_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_ends_authenticated_session() {
        let (_, manager) = session_with(
            Arc::new(MemoryStore::new()),
            MockBackend::new().on_refresh(Reply::Err(ApiError::Rejected("revoked".into()))),
        );
        manager.initialize().await;
        // Expires inside the refresh buffer, so the next token request refreshes
        manager
            .sign_in(TokenGrant::new("A1", "R1").with_expires_in(10))
            .await
            .unwrap();
        let mut updates = manager.subscribe();
        updates.borrow_and_update();

        assert_eq!(manager.tokens().get_valid_token().await, None);

        updates.changed().await.unwrap();
        assert_eq!(updates.borrow().phase, SessionPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_stored_expiry_survives_restart() {
        let storage = stored(3600).await;
        let expiry = storage.get("tokenExpiry").await.unwrap().unwrap();
        assert_eq!(
            ExpiryTimestamp::parse(&expiry).unwrap().as_millis(),
            NOW_MS + 3_600_000
        );

        let (backend, manager) =
            session_with(storage, MockBackend::new().on_profile(Reply::Ok(profile("u-1"))));
        assert_eq!(manager.initialize().await.phase, SessionPhase::Authenticated);
        assert_eq!(backend.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_sign_in_without_refresh_token_is_rejected() {
        let (_, manager) = session_with(Arc::new(MemoryStore::new()), MockBackend::new());
        manager.initialize().await;
        let grant = TokenGrant {
            access_token: "A1".into(),
            refresh_token: None,
            expires_in: Some(3600),
        };

        let err = manager.sign_in(grant).await.unwrap_err();

        assert!(matches!(err, AuthError::Authentication(_)));
        assert_eq!(manager.state().phase, SessionPhase::Error);
        assert_eq!(manager.tokens().record().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_refresh_stays_signed_out() {
        let (backend, manager) = session_with(
            Arc::new(MemoryStore::new()),
            MockBackend::new()
                .with_refresh_delay(Duration::from_secs(1))
                .on_refresh(Reply::Ok(TokenGrant::new("A2", "R2"))),
        );
        manager.initialize().await;
        manager
            .sign_in(TokenGrant::new("A1", "R1").with_expires_in(10))
            .await
            .unwrap();

        let tokens = Arc::clone(manager.tokens());
        let in_flight = tokio::spawn(async move { tokens.get_valid_token().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.sign_out().await;

        assert_eq!(in_flight.await.unwrap(), None);
        assert_eq!(backend.refresh_count(), 1);
        assert_eq!(manager.state().phase, SessionPhase::Unauthenticated);
        assert!(!manager.tokens().is_authenticated().await);
        assert_eq!(manager.tokens().record().await, None);
    }

    #[tokio::test]
    async fn test_sign_in_after_failed_refresh_stays_authenticated() {
        let (_, manager) = session_with(
            Arc::new(MemoryStore::new()),
            MockBackend::new().on_refresh(Reply::Err(ApiError::Unauthorized)),
        );
        manager.initialize().await;
        manager
            .sign_in(TokenGrant::new("A1", "R1").with_expires_in(10))
            .await
            .unwrap();

        assert_eq!(manager.tokens().get_valid_token().await, None);
        manager
            .sign_in(TokenGrant::new("A3", "R3").with_expires_in(3600))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(manager.state().phase, SessionPhase::Authenticated);
        assert_eq!(manager.tokens().get_valid_token().await.as_deref(), Some("A3"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stale_refresh_failure_never_ends_newer_session() {
        const ROUNDS: usize = 200;
        let backend = (0..ROUNDS).fold(MockBackend::new(), |backend, _| {
            backend.on_refresh(Reply::Err(ApiError::Unauthorized))
        });
        let (_, manager) = session_with(Arc::new(MemoryStore::new()), backend);
        manager.initialize().await;

        for round in 0..ROUNDS {
            manager
                .sign_in(TokenGrant::new("A1", "R1").with_expires_in(10))
                .await
                .unwrap();
            assert_eq!(manager.tokens().get_valid_token().await, None);

            manager
                .sign_in(TokenGrant::new("A3", "R3").with_expires_in(3600))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;

            assert_eq!(
                manager.state().phase,
                SessionPhase::Authenticated,
                "round {round} was signed out by an earlier refresh failure"
            );
        }
    }
}
