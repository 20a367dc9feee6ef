use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CounterError;
use crate::model::CounterKey;

/// Atomic counter service holding occupancy per (facility, vehicle class).
///
/// Only increment/decrement are atomic; there is no conditional update. Values may
/// go negative or above capacity; bounding them is the caller's job.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one and return the new value. A missing key starts at zero.
    async fn increment(&self, key: &CounterKey) -> Result<i64, CounterError>;

    /// Atomically subtract one and return the new value. A missing key starts at zero.
    async fn decrement(&self, key: &CounterKey) -> Result<i64, CounterError>;

    async fn get(&self, key: &CounterKey) -> Result<Option<i64>, CounterError>;

    async fn set(&self, key: &CounterKey, value: i64) -> Result<(), CounterError>;
}

/// In-process counter store. Each key lives in a DashMap shard, and the shard's
/// write lock makes read-modify-write atomic.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<CounterKey, i64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn add(&self, key: &CounterKey, delta: i64) -> i64 {
        let mut entry = self.counters.entry(*key).or_insert(0);
        *entry += delta;
        *entry
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &CounterKey) -> Result<i64, CounterError> {
        Ok(self.add(key, 1))
    }

    async fn decrement(&self, key: &CounterKey) -> Result<i64, CounterError> {
        Ok(self.add(key, -1))
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<i64>, CounterError> {
        Ok(self.counters.get(key).map(|e| *e.value()))
    }

    async fn set(&self, key: &CounterKey, value: i64) -> Result<(), CounterError> {
        self.counters.insert(*key, value);
        Ok(())
    }
}
