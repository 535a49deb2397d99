use thiserror::Error;

use crate::cache::StoreError;

/// Errors raised while building or operating the object factory.
///
/// Everything except [`Error::Store`] is a configuration error. These are reported by
/// [`DataConfig::validate`](crate::DataConfig::validate) at startup and never occur while a
/// benchmark is running.
#[derive(Debug, Error)]
pub enum Error {
    /// The bucket list is empty.
    #[error("no buckets configured")]
    NoBuckets,

    /// A size class has a lower bound above its upper bound.
    #[error("size class `{class}` has low bound {low} above high bound {high}")]
    InvertedSizeRange {
        /// Name of the offending size class.
        class: String,
        /// Configured lower bound in bytes.
        low: u64,
        /// Configured upper bound in bytes.
        high: u64,
    },

    /// A size class cannot produce a random size because its range is empty.
    #[error("size class `{class}` has an empty range [{low}, {high}) under the random policy")]
    EmptySizeRange {
        /// Name of the offending size class.
        class: String,
        /// Configured lower bound in bytes.
        low: u64,
        /// Configured upper bound in bytes.
        high: u64,
    },

    /// The size class weights add up to more than the weighted index supports.
    #[error("size class weights add up to {total}, at most {max} is supported")]
    TotalWeightTooLarge {
        /// Sum of all configured weights.
        total: u64,
        /// Largest supported sum.
        max: u64,
    },

    /// None of the size classes has a positive weight.
    #[error("no size class with a positive weight")]
    NoWeightedSizeClass,

    /// The sizing option is not one of `random` or `low_bound`.
    #[error("unsupported sizing option `{0}`, expected `random` or `low_bound`")]
    UnknownSizingPolicy(String),

    /// The shared payload buffer was configured with zero bytes.
    #[error("payload buffer must not be empty")]
    EmptyPayloadBuffer,

    /// The shared payload buffer exceeds the supported size.
    #[error("payload buffer of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadBufferTooLarge {
        /// Configured buffer size in bytes.
        size: u64,
        /// Largest supported buffer size in bytes.
        max: u64,
    },

    /// The upload limit is enabled without a counter key.
    #[error("upload limit enabled without a size counter key")]
    MissingSizeCounter,

    /// The external key-value store could not be reached or rejected a command.
    #[error("key-value store error: {context}")]
    Store {
        /// What the store was doing when the error occurred.
        context: String,
        /// The underlying store error.
        #[source]
        cause: StoreError,
    },
}

/// Result type for factory operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
