//! authkeep core - authentication token lifecycle for an API client.
//!
//! Persists an access/refresh token pair, refreshes it before it expires
//! with at most one refresh in flight, and tracks a coarse session state
//! that UI code can observe and gate protected views on.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

pub use api::{ApiError, AuthBackend, DeviceRegistry, HttpAuthBackend, TokenGrant, UserProfile};
pub use auth::{RefreshOutcome, TokenManager, TokenPair};
pub use config::{Config, SessionConfig, StorageBackend};
pub use error::AuthError;
pub use session::{
    AccessDecision, GuardedAccess, SessionManager, SessionPhase, SessionState, SideEffects,
};
pub use storage::{KeyValueStore, StorageError};
