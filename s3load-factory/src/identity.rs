//! Random object keys and bucket selection.

use rand::Rng;
use rand::distr::Alphanumeric;
use rand::seq::IndexedRandom;

use crate::error::{Error, Result};

/// Number of random alphanumeric characters appended to the key prefix.
pub const KEY_SUFFIX_LEN: usize = 16;

/// Generates object identities for new writes.
#[derive(Clone, Debug)]
pub struct IdentityGenerator {
    buckets: Vec<String>,
    prefix: String,
}

impl IdentityGenerator {
    /// Creates a generator over a non-empty list of buckets.
    pub fn new(buckets: Vec<String>, prefix: impl Into<String>) -> Result<Self> {
        if buckets.is_empty() {
            return Err(Error::NoBuckets);
        }

        Ok(Self {
            buckets,
            prefix: prefix.into(),
        })
    }

    /// The configured key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the prefix followed by [`KEY_SUFFIX_LEN`] random alphanumeric characters.
    pub fn next_key<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut key = String::with_capacity(self.prefix.len() + KEY_SUFFIX_LEN);
        key.push_str(&self.prefix);
        key.extend((0..KEY_SUFFIX_LEN).map(|_| char::from(rng.sample(Alphanumeric))));
        key
    }

    /// Picks one of the configured buckets uniformly.
    pub fn next_bucket<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        // `new` guarantees at least one bucket.
        self.buckets.choose(rng).map_or("", String::as_str)
    }
}
