use futures::future::{BoxFuture, FutureExt};
use keyring::Entry;

use super::{KeyValueStore, StorageError};

/// Default keychain service name
pub const SERVICE_NAME: &str = "authkeep";

/// Key-value store backed by the OS keychain, one entry per key.
///
/// The keyring API is blocking, so each call runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(String) -> Result<T, StorageError> + Send + 'static,
    {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || op(service))
            .await
            .map_err(|e| StorageError::Unavailable(format!("keychain task failed: {e}")))?
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl KeyValueStore for KeyringStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StorageError>> {
        let key = key.to_string();
        async move {
            self.blocking(move |service| {
                match Entry::new(&service, &key)?.get_password() {
                    Ok(value) => Ok(Some(value)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
        }
        .boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        let key = key.to_string();
        let value = value.to_string();
        async move {
            self.blocking(move |service| {
                Entry::new(&service, &key)?.set_password(&value)?;
                Ok(())
            })
            .await
        }
        .boxed()
    }

    fn remove<'a>(&'a self, keys: &'a [&'a str]) -> BoxFuture<'a, Result<(), StorageError>> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        async move {
            self.blocking(move |service| {
                for key in keys {
                    match Entry::new(&service, &key)?.delete_credential() {
                        Ok(()) | Err(keyring::Error::NoEntry) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            })
            .await
        }
        .boxed()
    }
}
