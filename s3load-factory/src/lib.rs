//! The object lifecycle core of an object storage load generator.
//!
//! This crate synthesizes the targets and payloads of storage operations without generating real
//! data per request and without tracking objects in process memory:
//!
//! - [`payload`] produces arbitrarily large readable and seekable byte streams that tile a small
//!   shared random buffer.
//! - [`sizing`] draws object sizes from weighted, named size classes.
//! - [`identity`] generates random object keys and picks target buckets.
//! - [`cache`] records written objects in an external key-value store, so that reads and deletes
//!   can target objects that actually exist, and counts uploaded bytes against an optional limit.
//! - [`factory`] ties these together into [`ObjectSpec`]s that a driver executes against the
//!   storage system.
//!
//! A driver asks [`ObjectFactory::prepare`] for a spec, performs the storage request with its
//! bucket, key and payload, and hands the [`Outcome`] back to [`ObjectFactory::finalize`].
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod identity;
pub mod payload;
pub mod sink;
pub mod sizing;

pub use crate::cache::{
    CacheEntry, InMemoryStore, KvStore, LifecycleCache, RedisStore, UploadCounter,
};
pub use crate::config::{CacheConfig, DataConfig, SizeClassConfig, UploadLimitConfig};
pub use crate::error::{Error, Result};
pub use crate::factory::{
    NoObjectAvailable, ObjectFactory, ObjectSpec, OperationKind, Outcome, ParseOperationError,
    PrepareError,
};
pub use crate::payload::{PayloadStream, RandomBuffer, SyntheticPayload};
pub use crate::sink::DigestSink;
pub use crate::sizing::{SizeTable, SizingPolicy};
