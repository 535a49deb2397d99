//! Typed configuration consumed by the object factory.
//!
//! These structs mirror the `data` and `cache` sections of the load test configuration file:
//!
//! ```yaml
//! data:
//!   buckets: [bucket-0, bucket-1]
//!   object_prefix: obj-
//!   sizing_option: random
//!   cache_result: true
//!   weights:
//!     small:
//!       LOW: 1KiB
//!       HIGH: 64KiB
//!       WEIGHT: 8
//!     large:
//!       LOW: 1MiB
//!       HIGH: 16MiB
//!       WEIGHT: 1
//!
//!   upload_limit:
//!     limited: true
//!     size_limit: 100GiB
//!
//! cache:
//!   server: 127.0.0.1
//!   port: 6379
//!   db: 0
//! ```
//!
//! Loading these sections from files and the environment is left to the binary.

use std::collections::BTreeMap;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::payload::{DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};
use crate::sizing::{SizeTable, SizingPolicy};

/// Size bounds and weight of one size class.
///
/// Bounds accept plain byte counts as well as human readable sizes such as `"4KiB"` or `"1MB"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SizeClassConfig {
    /// Inclusive lower bound.
    #[serde(rename = "LOW", alias = "low")]
    pub low: ByteSize,
    /// Exclusive upper bound.
    #[serde(rename = "HIGH", alias = "high")]
    pub high: ByteSize,
    /// Relative selection weight.
    #[serde(rename = "WEIGHT", alias = "weight")]
    pub weight: u32,
}

/// Configuration of generated objects and their lifecycle tracking.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DataConfig {
    /// Buckets that new objects are spread across uniformly.
    pub buckets: Vec<String>,

    /// Namespace prepended to every generated object key.
    pub object_prefix: String,

    /// How sizes are derived from the selected size class.
    ///
    /// # Default
    ///
    /// `random`
    pub sizing_option: SizingPolicy,

    /// Size classes by name.
    pub weights: BTreeMap<String, SizeClassConfig>,

    /// Track written objects in the lifecycle cache so that reads and deletes can target them.
    ///
    /// When disabled, reads and deletes never find an object.
    pub cache_result: bool,

    /// Record payload checksums on write and verify them on read.
    pub integrity_check: bool,

    /// Size of the shared random buffer backing all payloads.
    ///
    /// # Default
    ///
    /// `8 MiB`
    pub payload_buffer: ByteSize,

    /// Pause between attempts when no cached object is available for a read or delete.
    ///
    /// # Default
    ///
    /// `10ms`
    #[serde(with = "humantime_serde")]
    pub pick_backoff: Duration,

    /// Number of attempts made by [`ObjectFactory::prepare_retrying`](crate::ObjectFactory::prepare_retrying).
    ///
    /// # Default
    ///
    /// `100`
    pub pick_attempts: usize,

    /// Stop writing once the total uploaded size reaches a limit.
    pub upload_limit: UploadLimitConfig,
}

/// A global cap on the number of bytes written by all workers.
///
/// Progress is kept in a counter in the external key-value store, so that every process of a
/// distributed run sees the same total.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadLimitConfig {
    /// Enforce the limit.
    pub limited: bool,

    /// Key of the counter holding the number of bytes written so far.
    ///
    /// # Default
    ///
    /// `s3load:uploaded_bytes`
    pub size_counter: String,

    /// Writes are refused once the counter exceeds this size.
    pub size_limit: ByteSize,
}

impl Default for UploadLimitConfig {
    fn default() -> Self {
        Self {
            limited: false,
            size_counter: "s3load:uploaded_bytes".to_owned(),
            size_limit: ByteSize::b(0),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            object_prefix: String::new(),
            sizing_option: SizingPolicy::default(),
            weights: BTreeMap::new(),
            cache_result: false,
            integrity_check: false,
            payload_buffer: ByteSize::b(DEFAULT_BUFFER_SIZE),
            pick_backoff: Duration::from_millis(10),
            pick_attempts: 100,
            upload_limit: UploadLimitConfig::default(),
        }
    }
}

impl DataConfig {
    /// Checks everything that would otherwise fail once the benchmark is running.
    pub fn validate(&self) -> Result<()> {
        if self.buckets.is_empty() {
            return Err(Error::NoBuckets);
        }
        let buffer_size = self.payload_buffer.as_u64();
        if buffer_size == 0 {
            return Err(Error::EmptyPayloadBuffer);
        }
        if buffer_size > MAX_BUFFER_SIZE {
            return Err(Error::PayloadBufferTooLarge {
                size: buffer_size,
                max: MAX_BUFFER_SIZE,
            });
        }
        if self.upload_limit.limited && self.upload_limit.size_counter.is_empty() {
            return Err(Error::MissingSizeCounter);
        }
        SizeTable::new(&self.weights, self.sizing_option)?;
        Ok(())
    }
}

/// Location of the external key-value store backing the lifecycle cache.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hostname or address of the store.
    pub server: String,
    /// TCP port of the store.
    pub port: u16,
    /// Logical database number.
    pub db: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_owned(),
            port: 6379,
            db: 0,
        }
    }
}

impl CacheConfig {
    /// The connection URL in `redis://` form.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.server, self.port, self.db)
    }
}
