//! A global byte counter shared by every worker of a distributed run.

use super::{BoxedStore, RedisStore};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Counts bytes written across all processes in a [`KvStore`](super::KvStore).
///
/// Like the lifecycle cache, a counter is best effort: store failures are logged and reported as
/// an unknown value. A disabled counter counts nothing.
#[derive(Debug)]
pub struct UploadCounter {
    store: Option<BoxedStore>,
}

impl UploadCounter {
    /// Creates a counter backed by the given store.
    pub fn new(store: BoxedStore) -> Self {
        Self { store: Some(store) }
    }

    /// Creates a counter that counts nothing.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Connects to the Redis server described by `config`.
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let store = RedisStore::connect(config)
            .await
            .map_err(|cause| Error::Store {
                context: format!("failed to connect counter to {}", config.url()),
                cause,
            })?;
        Ok(Self::new(Box::new(store)))
    }

    /// Returns `true` if bytes are being counted.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// The current value at `key`, or `None` if disabled or unavailable.
    pub async fn current(&self, key: &str) -> Option<u64> {
        let store = self.store.as_ref()?;

        match store.counter(key).await {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    store = store.name(),
                    key,
                    "failed to read upload counter"
                );
                None
            }
        }
    }

    /// Adds `bytes` to the counter at `key`.
    pub async fn add(&self, key: &str, bytes: u64) {
        let Some(store) = &self.store else {
            return;
        };

        if let Err(err) = store.incr_by(key, bytes).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                store = store.name(),
                key,
                bytes,
                "failed to update upload counter"
            );
        }
    }
}
