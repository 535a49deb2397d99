//! Preparation and finalization of individual storage operations.
//!
//! Each operation moves through `prepare -> execute -> finalize`. The factory owns the first and
//! last steps; the driver executes the storage request in between:
//!
//! - [`ObjectFactory::prepare`] manufactures a new object for writes, and recalls a tracked
//!   object from the [`LifecycleCache`] for reads and deletes.
//! - [`ObjectFactory::finalize`] reports the outcome and updates the lifecycle cache: successful
//!   writes are recorded, successful deletes are forgotten, everything else leaves it untouched.
//!
//! With an upload limit configured, successful writes also add their size to a global
//! [`UploadCounter`], and new writes are refused once the counter exceeds the limit.

use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::cache::{CacheEntry, LifecycleCache, UploadCounter};
use crate::config::{CacheConfig, DataConfig, UploadLimitConfig};
use crate::error::{Error, Result};
use crate::identity::IdentityGenerator;
use crate::payload::{RandomBuffer, SyntheticPayload};
use crate::sink::DigestSink;
use crate::sizing::SizeTable;

thread_local! {
    static RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

fn with_rng<T>(f: impl FnOnce(&mut SmallRng) -> T) -> T {
    RNG.with_borrow_mut(f)
}

/// The kind of storage operation an [`ObjectSpec`] is prepared for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Upload a new object.
    Write,
    /// Download a previously written object.
    Read,
    /// Delete a previously written object.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Write => "write",
            Self::Read => "read",
            Self::Delete => "delete",
        })
    }
}

/// Error returned when parsing an unknown [`OperationKind`].
#[derive(Debug, Error)]
#[error("unknown operation `{0}`, expected one of `write`, `read`, `delete`")]
pub struct ParseOperationError(String);

impl FromStr for OperationKind {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "write" => Ok(Self::Write),
            "read" => Ok(Self::Read),
            "delete" => Ok(Self::Delete),
            other => Err(ParseOperationError(other.to_owned())),
        }
    }
}

/// No tracked object is available for a read or delete.
///
/// This is expected early in a run and whenever caching is disabled. Callers should back off and
/// retry instead of reporting a failed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("no object available")]
pub struct NoObjectAvailable;

/// Reasons why [`ObjectFactory::prepare`] has no spec to offer.
///
/// Neither is an operation failure. The driver should skip the operation and back off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PrepareError {
    /// A read or delete found no tracked object.
    #[error(transparent)]
    NoObjectAvailable(#[from] NoObjectAvailable),

    /// A write was refused because the configured upload limit is exhausted.
    #[error("upload size limit reached")]
    UploadLimitReached,
}

/// The target and payload of a single storage operation.
///
/// A spec lives for exactly one operation: it is created by [`ObjectFactory::prepare`] right
/// before the storage call and consumed by [`ObjectFactory::finalize`] right after.
#[derive(Debug)]
pub struct ObjectSpec {
    /// The target bucket.
    pub bucket: String,
    /// The target object key.
    pub key: String,
    /// The payload length for writes, `0` for reads and deletes.
    pub size: u64,
    /// The drawn size class for writes.
    pub size_class: Option<String>,
    /// The content to upload, present only for writes.
    pub payload: Option<SyntheticPayload>,
    /// The size recorded when the object was written, for reads and deletes.
    pub expected_size: Option<u64>,
    /// The checksum recorded when the object was written, if integrity checking is enabled.
    pub expected_checksum: Option<u32>,
    kind: OperationKind,
}

impl ObjectSpec {
    /// The operation this spec was prepared for.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Takes the payload out of the spec, leaving `None`.
    pub fn take_payload(&mut self) -> Option<SyntheticPayload> {
        self.payload.take()
    }

    /// Compares downloaded content against the recorded checksum.
    ///
    /// Returns `None` if there is nothing to compare, either because no checksum was recorded or
    /// because the sink did not compute one.
    pub fn verify(&self, sink: &DigestSink) -> Option<bool> {
        let expected = self.expected_checksum?;
        let actual = sink.checksum()?;
        Some(expected == actual)
    }
}

/// The result of executing an [`ObjectSpec`], reported to [`ObjectFactory::finalize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The storage call succeeded after transferring the given number of bytes.
    Success {
        /// Bytes uploaded or downloaded.
        bytes: u64,
    },
    /// The storage call failed.
    Failure {
        /// A description of the failure, for logs.
        reason: String,
    },
}

impl Outcome {
    /// Creates a successful outcome.
    pub fn success(bytes: u64) -> Self {
        Self::Success { bytes }
    }

    /// Creates a failed outcome.
    pub fn failure(reason: impl fmt::Display) -> Self {
        Self::Failure {
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Creates and finalizes [`ObjectSpec`]s.
///
/// All state is immutable after construction except for the external lifecycle cache. The factory
/// is cheap to clone and can be shared by any number of concurrent workers.
#[derive(Clone, Debug)]
pub struct ObjectFactory(Arc<FactoryInner>);

#[derive(Debug)]
struct FactoryInner {
    identity: IdentityGenerator,
    sizes: SizeTable,
    buffer: RandomBuffer,
    cache: LifecycleCache,
    counter: UploadCounter,
    upload_limit: UploadLimitConfig,
    integrity_check: bool,
    pick_backoff: Duration,
    pick_attempts: usize,
}

impl ObjectFactory {
    /// Creates a factory, using `cache` only if `config.cache_result` is enabled and `counter`
    /// only if the upload limit is.
    pub fn new(config: &DataConfig, cache: LifecycleCache, counter: UploadCounter) -> Result<Self> {
        config.validate()?;

        let size = config.payload_buffer.as_u64();
        let buffer_len = usize::try_from(size).map_err(|_| Error::PayloadBufferTooLarge {
            size,
            max: crate::payload::MAX_BUFFER_SIZE,
        })?;
        let buffer = RandomBuffer::new(buffer_len)?;
        Self::with_buffer(config, buffer, cache, counter)
    }

    /// Creates a factory with a given payload buffer.
    pub fn with_buffer(
        config: &DataConfig,
        buffer: RandomBuffer,
        cache: LifecycleCache,
        counter: UploadCounter,
    ) -> Result<Self> {
        config.validate()?;

        let identity = IdentityGenerator::new(config.buckets.clone(), &config.object_prefix)?;
        let sizes = SizeTable::new(&config.weights, config.sizing_option)?;
        let cache = if config.cache_result {
            cache
        } else {
            LifecycleCache::disabled()
        };
        let counter = if config.upload_limit.limited {
            counter
        } else {
            UploadCounter::disabled()
        };

        tracing::debug!(
            buckets = config.buckets.len(),
            size_classes = sizes.classes().len(),
            policy = %sizes.policy(),
            caching = cache.is_enabled(),
            upload_limit = counter.is_enabled(),
            "object factory initialized"
        );

        Ok(Self(Arc::new(FactoryInner {
            identity,
            sizes,
            buffer,
            cache,
            counter,
            upload_limit: config.upload_limit.clone(),
            integrity_check: config.integrity_check,
            pick_backoff: config.pick_backoff,
            pick_attempts: config.pick_attempts,
        })))
    }

    /// Creates a factory, connecting to the cache and counter servers as far as `config` needs
    /// them.
    pub async fn connect(
        config: &DataConfig,
        cache_config: &CacheConfig,
        counter_config: &CacheConfig,
    ) -> Result<Self> {
        config.validate()?;

        let cache = if config.cache_result {
            LifecycleCache::connect(cache_config).await?
        } else {
            LifecycleCache::disabled()
        };
        let counter = if config.upload_limit.limited {
            UploadCounter::connect(counter_config).await?
        } else {
            UploadCounter::disabled()
        };
        Self::new(config, cache, counter)
    }

    /// The size classes used for writes.
    pub fn sizes(&self) -> &SizeTable {
        &self.0.sizes
    }

    /// The shared buffer backing all payloads.
    pub fn buffer(&self) -> &RandomBuffer {
        &self.0.buffer
    }

    /// The lifecycle cache tracking written objects.
    pub fn cache(&self) -> &LifecycleCache {
        &self.0.cache
    }

    /// Prepares a spec for the given operation.
    ///
    /// Writes fail with [`PrepareError::UploadLimitReached`] once the upload limit is exhausted.
    /// Reads and deletes fail with [`PrepareError::NoObjectAvailable`] if the lifecycle cache has
    /// no object to offer.
    pub async fn prepare(&self, kind: OperationKind) -> Result<ObjectSpec, PrepareError> {
        match kind {
            OperationKind::Write => {
                if self.upload_limit_reached().await {
                    return Err(PrepareError::UploadLimitReached);
                }
                Ok(self.prepare_write())
            }
            OperationKind::Read | OperationKind::Delete => Ok(self.recall(kind).await?),
        }
    }

    /// Like [`prepare`](Self::prepare), but waits out an empty lifecycle cache.
    ///
    /// Sleeps for the configured `pick_backoff` between attempts and gives up with
    /// [`PrepareError::NoObjectAvailable`] after `pick_attempts` tries. A reached upload limit is
    /// returned right away.
    pub async fn prepare_retrying(&self, kind: OperationKind) -> Result<ObjectSpec, PrepareError> {
        let mut attempts = self.0.pick_attempts.max(1);
        loop {
            match self.prepare(kind).await {
                Ok(spec) => return Ok(spec),
                Err(PrepareError::NoObjectAvailable(_)) if attempts > 1 => {
                    attempts -= 1;
                    tokio::time::sleep(self.0.pick_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Manufactures a new object for a write.
    ///
    /// This does not consult the upload limit.
    pub fn prepare_write(&self) -> ObjectSpec {
        with_rng(|rng| self.prepare_write_with(rng))
    }

    /// Manufactures a new object for a write using the given RNG.
    pub fn prepare_write_with<R: Rng + ?Sized>(&self, rng: &mut R) -> ObjectSpec {
        let inner = &self.0;
        let bucket = inner.identity.next_bucket(rng).to_owned();
        let key = inner.identity.next_key(rng);
        let draw = inner.sizes.draw(rng);

        ObjectSpec {
            bucket,
            key,
            size: draw.size,
            size_class: Some(draw.class.to_owned()),
            payload: Some(inner.buffer.open(draw.size)),
            expected_size: None,
            expected_checksum: None,
            kind: OperationKind::Write,
        }
    }

    async fn upload_limit_reached(&self) -> bool {
        let inner = &self.0;
        if !inner.counter.is_enabled() {
            return false;
        }

        let limit = inner.upload_limit.size_limit.as_u64();
        match inner.counter.current(&inner.upload_limit.size_counter).await {
            Some(uploaded) if uploaded > limit => {
                tracing::warn!(uploaded, limit, "upload size limit reached");
                true
            }
            _ => false,
        }
    }

    async fn recall(&self, kind: OperationKind) -> Result<ObjectSpec, NoObjectAvailable> {
        let entry = self.0.cache.pick_random().await.ok_or(NoObjectAvailable)?;

        Ok(ObjectSpec {
            bucket: entry.bucket,
            key: entry.key,
            size: 0,
            size_class: None,
            payload: None,
            expected_size: entry.size,
            expected_checksum: entry.checksum.filter(|_| self.0.integrity_check),
            kind,
        })
    }

    /// Reports the outcome of an executed spec and updates the lifecycle cache.
    pub async fn finalize(&self, spec: ObjectSpec, outcome: &Outcome) {
        let inner = &self.0;

        match (spec.kind, outcome) {
            (OperationKind::Write, Outcome::Success { .. }) => {
                let checksum = inner
                    .integrity_check
                    .then(|| inner.buffer.checksum(spec.size));
                let entry = CacheEntry {
                    bucket: spec.bucket,
                    key: spec.key,
                    size: Some(spec.size),
                    checksum,
                };
                inner.cache.insert(&entry).await;
                inner
                    .counter
                    .add(&inner.upload_limit.size_counter, spec.size)
                    .await;
            }
            (OperationKind::Delete, Outcome::Success { .. }) => {
                inner.cache.remove(&spec.key).await;
            }
            (OperationKind::Read, Outcome::Success { .. }) => {}
            (kind, Outcome::Failure { reason }) => {
                tracing::debug!(%kind, key = %spec.key, reason = %reason, "operation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytesize::ByteSize;

    use super::*;
    use crate::cache::{InMemoryStore, KvStore};
    use crate::config::SizeClassConfig;
    use crate::sizing::SizingPolicy;

    fn config(cache_result: bool) -> DataConfig {
        let weights = BTreeMap::from([(
            "1k".to_owned(),
            SizeClassConfig {
                low: ByteSize::b(1024),
                high: ByteSize::b(2048),
                weight: 1,
            },
        )]);

        DataConfig {
            buckets: vec!["b0".into()],
            object_prefix: "obj-".into(),
            sizing_option: SizingPolicy::LowBound,
            weights,
            cache_result,
            pick_backoff: Duration::from_millis(10),
            pick_attempts: 5,
            ..Default::default()
        }
    }

    fn factory(config: &DataConfig) -> (InMemoryStore, ObjectFactory) {
        let store = InMemoryStore::new();
        let cache = LifecycleCache::new(Box::new(store.clone()));
        let counter = UploadCounter::new(Box::new(store.clone()));
        let buffer = RandomBuffer::with_seed(4096, 0).unwrap();
        let factory = ObjectFactory::with_buffer(config, buffer, cache, counter).unwrap();
        (store, factory)
    }

    fn limited(size_limit: u64) -> DataConfig {
        DataConfig {
            upload_limit: UploadLimitConfig {
                limited: true,
                size_counter: "uploaded".into(),
                size_limit: ByteSize::b(size_limit),
            },
            ..config(true)
        }
    }

    #[test]
    fn parses_operation_kinds() {
        assert_eq!("write".parse::<OperationKind>().unwrap(), OperationKind::Write);
        assert_eq!("read".parse::<OperationKind>().unwrap(), OperationKind::Read);
        assert_eq!("delete".parse::<OperationKind>().unwrap(), OperationKind::Delete);
        assert!("head".parse::<OperationKind>().is_err());
    }

    #[tokio::test]
    async fn prepares_writes_from_config() {
        let (_store, factory) = factory(&config(true));

        let spec = factory.prepare(OperationKind::Write).await.unwrap();
        assert_eq!(spec.kind(), OperationKind::Write);
        assert_eq!(spec.bucket, "b0");
        assert_eq!(spec.size, 1024);
        assert_eq!(spec.size_class.as_deref(), Some("1k"));

        let suffix = spec.key.strip_prefix("obj-").unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));

        assert_eq!(spec.payload.as_ref().map(SyntheticPayload::len), Some(1024));
    }

    #[tokio::test]
    async fn empty_cache_has_no_objects() {
        let (_store, factory) = factory(&config(true));

        let read = factory.prepare(OperationKind::Read).await;
        assert_eq!(read.unwrap_err(), PrepareError::NoObjectAvailable(NoObjectAvailable));
        let delete = factory.prepare(OperationKind::Delete).await;
        assert_eq!(delete.unwrap_err(), PrepareError::NoObjectAvailable(NoObjectAvailable));
    }

    #[tokio::test]
    async fn successful_write_becomes_readable() {
        let (store, factory) = factory(&config(true));

        let spec = factory.prepare_write();
        let (bucket, key) = (spec.bucket.clone(), spec.key.clone());
        factory.finalize(spec, &Outcome::success(1024)).await;
        assert!(store.contains(&key));

        let read = factory.prepare(OperationKind::Read).await.unwrap();
        assert_eq!(read.kind(), OperationKind::Read);
        assert_eq!(read.bucket, bucket);
        assert_eq!(read.key, key);
        assert_eq!(read.size, 0);
        assert_eq!(read.expected_size, Some(1024));
        assert!(read.payload.is_none());

        factory.finalize(read, &Outcome::success(1024)).await;
        assert!(store.contains(&key));
    }

    #[tokio::test]
    async fn failed_write_is_not_tracked() {
        let (store, factory) = factory(&config(true));

        let spec = factory.prepare_write();
        factory.finalize(spec, &Outcome::failure("503 Slow Down")).await;

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_outcome_controls_removal() {
        let (store, factory) = factory(&config(true));
        let spec = factory.prepare_write();
        let key = spec.key.clone();
        factory.finalize(spec, &Outcome::success(1024)).await;

        let delete = factory.prepare(OperationKind::Delete).await.unwrap();
        factory.finalize(delete, &Outcome::failure("timeout")).await;
        assert!(store.contains(&key));

        let delete = factory.prepare(OperationKind::Delete).await.unwrap();
        factory.finalize(delete, &Outcome::success(0)).await;
        assert!(!store.contains(&key));

        let read = factory.prepare(OperationKind::Read).await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn disabled_caching_tracks_nothing() {
        let (store, factory) = factory(&config(false));
        assert!(!factory.cache().is_enabled());

        for _ in 0..10 {
            let spec = factory.prepare_write();
            factory.finalize(spec, &Outcome::success(1024)).await;
        }

        assert!(store.is_empty());
        assert!(factory.prepare(OperationKind::Read).await.is_err());
    }

    #[tokio::test]
    async fn integrity_checksums_round_trip() {
        let config = DataConfig {
            integrity_check: true,
            ..config(true)
        };
        let (_store, factory) = factory(&config);

        let mut spec = factory.prepare_write();
        let payload = spec.take_payload().unwrap();
        factory.finalize(spec, &Outcome::success(payload.len())).await;

        let read = factory.prepare(OperationKind::Read).await.unwrap();
        assert_eq!(read.expected_checksum, Some(payload.checksum()));

        let mut sink = DigestSink::with_digest();
        std::io::copy(&mut payload.clone(), &mut sink).unwrap();
        assert_eq!(read.verify(&sink), Some(true));

        let mut corrupted = DigestSink::with_digest();
        std::io::Write::write_all(&mut corrupted, b"garbage").unwrap();
        assert_eq!(read.verify(&corrupted), Some(false));

        assert_eq!(read.verify(&DigestSink::new()), None);
    }

    #[tokio::test]
    async fn checksums_are_ignored_without_integrity_check() {
        let (_store, factory) = factory(&config(true));

        let spec = factory.prepare_write();
        factory.finalize(spec, &Outcome::success(1024)).await;

        let read = factory.prepare(OperationKind::Read).await.unwrap();
        assert_eq!(read.expected_checksum, None);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_waits_for_a_write() {
        let (_store, factory) = factory(&config(true));

        let writer = factory.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let spec = writer.prepare_write();
            writer.finalize(spec, &Outcome::success(1024)).await;
        });

        let spec = factory.prepare_retrying(OperationKind::Read).await.unwrap();
        assert_eq!(spec.kind(), OperationKind::Read);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_gives_up() {
        let (_store, factory) = factory(&config(true));

        let start = tokio::time::Instant::now();
        let result = factory.prepare_retrying(OperationKind::Delete).await;

        assert_eq!(result.unwrap_err(), PrepareError::NoObjectAvailable(NoObjectAvailable));
        // Five attempts with four pauses in between.
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn rejects_invalid_config() {
        let config = DataConfig {
            buckets: vec![],
            ..config(true)
        };
        let result =
            ObjectFactory::new(&config, LifecycleCache::disabled(), UploadCounter::disabled());
        assert!(matches!(result, Err(Error::NoBuckets)));
    }

    #[test]
    fn rejects_oversized_buffer_before_allocating() {
        let config = DataConfig {
            payload_buffer: ByteSize::gib(64),
            ..config(true)
        };
        let result =
            ObjectFactory::new(&config, LifecycleCache::disabled(), UploadCounter::disabled());
        assert!(matches!(result, Err(Error::PayloadBufferTooLarge { .. })));
    }

    #[tokio::test]
    async fn successful_writes_are_counted() {
        let (store, factory) = factory(&limited(1 << 20));

        for _ in 0..3 {
            let spec = factory.prepare(OperationKind::Write).await.unwrap();
            factory.finalize(spec, &Outcome::success(1024)).await;
        }
        let spec = factory.prepare(OperationKind::Write).await.unwrap();
        factory.finalize(spec, &Outcome::failure("500")).await;

        assert_eq!(store.counter("uploaded").await.unwrap(), 3 * 1024);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn writes_stop_above_upload_limit() {
        let (store, factory) = factory(&limited(2048));

        // Writes continue until the counter exceeds the limit.
        for _ in 0..3 {
            let spec = factory.prepare(OperationKind::Write).await.unwrap();
            factory.finalize(spec, &Outcome::success(1024)).await;
        }
        assert_eq!(store.counter("uploaded").await.unwrap(), 3072);

        let write = factory.prepare(OperationKind::Write).await;
        assert_eq!(write.unwrap_err(), PrepareError::UploadLimitReached);
        let write = factory.prepare_retrying(OperationKind::Write).await;
        assert_eq!(write.unwrap_err(), PrepareError::UploadLimitReached);

        // Reads and deletes are unaffected.
        assert!(factory.prepare(OperationKind::Read).await.is_ok());
    }

    #[tokio::test]
    async fn counter_is_ignored_without_upload_limit() {
        let (store, factory) = factory(&config(true));
        store.incr_by("uploaded", u64::MAX).await.unwrap();

        let spec = factory.prepare(OperationKind::Write).await.unwrap();
        factory.finalize(spec, &Outcome::success(1024)).await;

        assert_eq!(store.counter("uploaded").await.unwrap(), u64::MAX);
        assert_eq!(store.counter("s3load:uploaded_bytes").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_counter_does_not_block_writes() {
        let (store, factory) = factory(&limited(0));
        store.incr_by("uploaded", 10).await.unwrap();
        assert!(factory.prepare(OperationKind::Write).await.is_err());

        store.set_unavailable(true);
        assert!(factory.prepare(OperationKind::Write).await.is_ok());
    }
}
