//! In-memory store for tests and dry runs.
//!
//! This provides a [`KvStore`] backed by a `HashMap`, removing the need for a running Redis
//! server. The store is [`Clone`] so callers can keep a handle for inspection while the
//! [`LifecycleCache`](super::LifecycleCache) owns a boxed copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::seq::IndexedRandom;

use super::{KvStore, StoreError, StoreResult};

type Fields = HashMap<String, String>;

#[derive(Debug, Default)]
struct Inner {
    /// Field maps with the position of their key in `keys`.
    entries: HashMap<String, (usize, Fields)>,
    /// All keys of `entries`, for constant-time random picks.
    keys: Vec<String>,
    counters: HashMap<String, u64>,
    unavailable: bool,
}

impl Inner {
    fn remove(&mut self, key: &str) {
        let Some((index, _)) = self.entries.remove(key) else {
            return;
        };

        self.keys.swap_remove(index);
        if let Some(moved) = self.keys.get(index) {
            if let Some((moved_index, _)) = self.entries.get_mut(moved) {
                *moved_index = index;
            }
        }
    }
}

/// A [`KvStore`] that keeps all entries in process memory.
///
/// Counters live in their own key space and are not returned by random picks.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored field maps.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns `true` if no field maps are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Returns `true` if a field map is stored at `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(key)
    }

    /// Makes every subsequent call fail until reset, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    fn check_available(inner: &Inner) -> StoreResult<()> {
        if inner.unavailable {
            return Err(StoreError::Generic {
                context: "in-memory store is unavailable".to_owned(),
                cause: "simulated outage".into(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;

        let Inner { entries, keys, .. } = &mut *inner;
        let (_, entry) = entries.entry(key.to_owned()).or_insert_with(|| {
            keys.push(key.to_owned());
            (keys.len() - 1, Fields::new())
        });
        for (field, value) in fields {
            entry.insert((*field).to_owned(), value.clone());
        }
        Ok(())
    }

    async fn random_key(&self) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;

        Ok(inner.keys.choose(&mut rand::rng()).cloned())
    }

    async fn get_fields(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;

        let entry = inner.entries.get(key).map(|(_, fields)| fields);
        Ok(fields
            .iter()
            .map(|field| entry.and_then(|entry| entry.get(*field).cloned()))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;

        inner.remove(key);
        inner.counters.remove(key);
        Ok(())
    }

    async fn counter(&self, key: &str) -> StoreResult<u64> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;

        Ok(inner.counters.get(key).copied().unwrap_or(0))
    }

    async fn incr_by(&self, key: &str, delta: u64) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;

        let value = inner.counters.entry(key.to_owned()).or_default();
        *value = value.saturating_add(delta);
        Ok(*value)
    }
}
