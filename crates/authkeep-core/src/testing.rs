//! Hand-written collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};

use crate::api::{ApiError, AuthBackend, DeviceRegistry, TokenGrant, UserProfile};
use crate::auth::Clock;
use crate::storage::{KeyValueStore, StorageError};

/// Clock frozen at a fixed instant.
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).expect("valid test timestamp"))
    }

    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Store whose every operation never completes.
pub struct HangingStore;

impl KeyValueStore for HangingStore {
    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<String>, StorageError>> {
        future::pending().boxed()
    }

    fn set<'a>(&'a self, _key: &'a str, _value: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        future::pending().boxed()
    }

    fn remove<'a>(&'a self, _keys: &'a [&'a str]) -> BoxFuture<'a, Result<(), StorageError>> {
        future::pending().boxed()
    }
}

/// Store whose every operation fails.
pub struct BrokenStore;

impl KeyValueStore for BrokenStore {
    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<String>, StorageError>> {
        future::ready(Err(StorageError::Unavailable("disk on fire".into()))).boxed()
    }

    fn set<'a>(&'a self, _key: &'a str, _value: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        future::ready(Err(StorageError::Unavailable("disk on fire".into()))).boxed()
    }

    fn remove<'a>(&'a self, _keys: &'a [&'a str]) -> BoxFuture<'a, Result<(), StorageError>> {
        future::ready(Err(StorageError::Unavailable("disk on fire".into()))).boxed()
    }
}

/// What a scripted backend call should do.
pub enum Reply<T> {
    Ok(T),
    Err(ApiError),
    Hang,
}

/// Scripted `AuthBackend` that counts calls.
///
/// Refresh replies are consumed in order; once the script runs out, the
/// last-resort reply is a transport error.
#[derive(Default)]
pub struct MockBackend {
    pub refresh_calls: AtomicUsize,
    pub login_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
    refresh_delay: Option<Duration>,
    refresh_replies: Mutex<VecDeque<Reply<TokenGrant>>>,
    login_replies: Mutex<VecDeque<Reply<TokenGrant>>>,
    logout_replies: Mutex<VecDeque<Reply<()>>>,
    profile_replies: Mutex<VecDeque<Reply<UserProfile>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every refresh call before replying.
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = Some(delay);
        self
    }

    pub fn on_refresh(self, reply: Reply<TokenGrant>) -> Self {
        self.refresh_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn on_login(self, reply: Reply<TokenGrant>) -> Self {
        self.login_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn on_logout(self, reply: Reply<()>) -> Self {
        self.logout_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn on_profile(self, reply: Reply<UserProfile>) -> Self {
        self.profile_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn next<T>(queue: &Mutex<VecDeque<Reply<T>>>) -> Reply<T> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Err(ApiError::Transport("no scripted reply".into())))
    }

    async fn resolve<T>(reply: Reply<T>) -> Result<T, ApiError> {
        match reply {
            Reply::Ok(value) => Ok(value),
            Reply::Err(e) => Err(e),
            Reply::Hang => future::pending().await,
        }
    }
}

impl AuthBackend for MockBackend {
    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant, ApiError>> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let reply = Self::next(&self.refresh_replies);
        let delay = self.refresh_delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Self::resolve(reply).await
        }
        .boxed()
    }

    fn login<'a>(
        &'a self,
        _email: &'a str,
        _password: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, ApiError>> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        Self::resolve(Self::next(&self.login_replies)).boxed()
    }

    fn logout<'a>(&'a self, _access_token: &'a str) -> BoxFuture<'a, Result<(), ApiError>> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Self::resolve(Self::next(&self.logout_replies)).boxed()
    }

    fn fetch_profile<'a>(
        &'a self,
        _access_token: &'a str,
    ) -> BoxFuture<'a, Result<UserProfile, ApiError>> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        Self::resolve(Self::next(&self.profile_replies)).boxed()
    }
}

/// Device registry that records calls and fails on demand.
#[derive(Default)]
pub struct MockDevices {
    pub unregister_calls: AtomicUsize,
    pub fail: bool,
}

impl DeviceRegistry for MockDevices {
    fn unregister<'a>(
        &'a self,
        _access_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail {
            Err(ApiError::Transport("push service unreachable".into()))
        } else {
            Ok(())
        };
        future::ready(result).boxed()
    }
}

pub fn profile(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        email: Some(format!("{id}@example.com")),
        name: None,
    }
}
