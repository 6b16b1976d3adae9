//! Persistent key-value storage for credentials.
//!
//! The credential layer only needs three operations from its backing store:
//! `get`, `set`, and a multi-key `remove`. Backends:
//! - `MemoryStore`: process-local map, used by tests and the `memory` backend
//! - `FileStore`: a single JSON object on disk, rewritten atomically
//! - `KeyringStore`: one OS keychain entry per key

pub mod file;
pub mod keychain;
pub mod memory;

use futures::future::BoxFuture;
use thiserror::Error;

pub use file::FileStore;
pub use keychain::KeyringStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Corrupt storage data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// String key-value store the credential layer persists into.
///
/// Object safe so services can hold an `Arc<dyn KeyValueStore>` chosen at
/// startup.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. Missing keys are `Ok(None)`, not an error.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StorageError>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Remove every listed key in one logical operation. Keys that are
    /// already absent are ignored.
    fn remove<'a>(&'a self, keys: &'a [&'a str]) -> BoxFuture<'a, Result<(), StorageError>>;
}
