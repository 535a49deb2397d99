//! Lifecycle tracking of generated objects in an external key-value store.
//!
//! Every successful write records its bucket and key as a small field map in the store, keyed by
//! the object key itself. Reads and deletes pick a random recorded entry; successful deletes
//! remove it again. Entries are picked uniformly from the store's key space, there is no ordering
//! or recency relation between them.
//!
//! Store failures while inserting, picking or removing are logged and never reach the caller.

use std::fmt::Debug;

use thiserror::Error;

use crate::config::CacheConfig;
use crate::error::{Error, Result};

mod counter;
mod in_memory;
mod redis_store;

pub use self::counter::UploadCounter;
pub use self::in_memory::InMemoryStore;
pub use self::redis_store::RedisStore;

const FIELD_BUCKET: &str = "b";
const FIELD_KEY: &str = "k";
const FIELD_SIZE: &str = "s";
const FIELD_CHECKSUM: &str = "c";

/// Errors reported by a [`KvStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Errors from the Redis client, including connection and protocol errors.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Any other error specific to a store implementation.
    #[error("store error: {context}")]
    Generic {
        /// What the store was doing when the error occurred.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for [`KvStore`] operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The subset of a key-value service used for lifecycle tracking and upload accounting.
///
/// Implementations provide their own atomicity and timeouts per call.
#[async_trait::async_trait]
pub trait KvStore: Debug + Send + Sync + 'static {
    /// The store name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Sets the given fields of the field map at `key`, creating it if necessary.
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;

    /// Returns an arbitrary existing key, or `None` if the store is empty.
    async fn random_key(&self) -> StoreResult<Option<String>>;

    /// Returns the values of `fields` at `key`, `None` for each missing field.
    async fn get_fields(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>>;

    /// Removes `key` and all of its fields.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Returns the value of the counter at `key`, `0` if it does not exist.
    async fn counter(&self, key: &str) -> StoreResult<u64>;

    /// Atomically adds `delta` to the counter at `key` and returns the new value.
    async fn incr_by(&self, key: &str, delta: u64) -> StoreResult<u64>;
}

/// A type-erased [`KvStore`] instance.
pub type BoxedStore = Box<dyn KvStore>;

/// An object known to exist in the storage system under test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// The bucket holding the object.
    pub bucket: String,
    /// The object key.
    pub key: String,
    /// The size the object was written with, if recorded.
    pub size: Option<u64>,
    /// CRC32 of the written content, recorded only when integrity checking is enabled.
    pub checksum: Option<u32>,
}

impl CacheEntry {
    /// Creates an entry without size or checksum.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size: None,
            checksum: None,
        }
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            (FIELD_BUCKET, self.bucket.clone()),
            (FIELD_KEY, self.key.clone()),
        ];
        if let Some(size) = self.size {
            fields.push((FIELD_SIZE, size.to_string()));
        }
        if let Some(checksum) = self.checksum {
            fields.push((FIELD_CHECKSUM, checksum.to_string()));
        }
        fields
    }

    fn from_fields(values: Vec<Option<String>>) -> Option<Self> {
        let mut values = values.into_iter();
        let bucket = values.next().flatten()?;
        let key = values.next().flatten()?;
        let size = values.next().flatten().and_then(|s| s.parse().ok());
        let checksum = values.next().flatten().and_then(|c| c.parse().ok());

        Some(Self {
            bucket,
            key,
            size,
            checksum,
        })
    }
}

/// Tracks which generated objects currently exist.
///
/// A disabled cache records nothing and never yields an entry.
#[derive(Debug)]
pub struct LifecycleCache {
    store: Option<BoxedStore>,
}

impl LifecycleCache {
    /// Creates a cache backed by the given store.
    pub fn new(store: BoxedStore) -> Self {
        Self { store: Some(store) }
    }

    /// Creates a cache that tracks nothing.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Connects to the Redis server described by `config`.
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let store = RedisStore::connect(config)
            .await
            .map_err(|cause| Error::Store {
                context: format!("failed to connect to {}", config.url()),
                cause,
            })?;
        Ok(Self::new(Box::new(store)))
    }

    /// Returns `true` if objects are being tracked.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Records an object after a successful write.
    ///
    /// Store failures are logged and otherwise ignored.
    pub async fn insert(&self, entry: &CacheEntry) {
        let Some(store) = &self.store else {
            return;
        };

        if let Err(err) = store.set_fields(&entry.key, &entry.to_fields()).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                store = store.name(),
                key = %entry.key,
                "failed to add object to lifecycle cache"
            );
        }
    }

    /// Picks a random tracked object, or `None` if there is none available.
    ///
    /// `None` is the normal answer for a disabled or empty cache, and is also returned after
    /// logging a store failure.
    pub async fn pick_random(&self) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;

        match Self::try_pick(store.as_ref()).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    store = store.name(),
                    "failed to pick object from lifecycle cache"
                );
                None
            }
        }
    }

    async fn try_pick(store: &dyn KvStore) -> StoreResult<Option<CacheEntry>> {
        let Some(key) = store.random_key().await? else {
            tracing::trace!("lifecycle cache is empty");
            return Ok(None);
        };

        let fields = [FIELD_BUCKET, FIELD_KEY, FIELD_SIZE, FIELD_CHECKSUM];
        let values = store.get_fields(&key, &fields).await?;

        // A concurrent delete may remove the entry between the two calls.
        let entry = CacheEntry::from_fields(values);
        if entry.is_none() {
            tracing::debug!(%key, "picked lifecycle cache entry vanished");
        }
        Ok(entry)
    }

    /// Forgets an object after a successful delete.
    ///
    /// Store failures are logged and otherwise ignored.
    pub async fn remove(&self, key: &str) {
        let Some(store) = &self.store else {
            return;
        };

        if let Err(err) = store.delete(key).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                store = store.name(),
                key,
                "failed to remove object from lifecycle cache"
            );
        }
    }
}
