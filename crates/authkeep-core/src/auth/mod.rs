//! Authentication token lifecycle.
//!
//! This module provides:
//! - `CredentialStore`: the four persisted credential fields over a key-value store
//! - `expiry`: staleness policy (tokens are refreshed 5 minutes before expiry)
//! - `RefreshCoordinator`: single-flight refresh shared by concurrent callers
//! - `TokenManager`: the service the rest of the app asks for tokens and headers

pub mod credentials;
pub mod expiry;
pub mod refresh;
pub mod tokens;

pub use credentials::{CredentialRecord, CredentialStore, TokenPair};
pub use expiry::{is_stale, Clock, ExpiryTimestamp, SystemClock};
pub use refresh::{RefreshCoordinator, RefreshFailure, RefreshOutcome};
pub use tokens::TokenManager;
