use crate::counter::Counter;
use crate::storage::keys::key_for_counter;
use crate::storage::{authorize, Authorization, CounterStorage, StorageErr};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use ttl_cache::TtlCache;

const DEFAULT_CAPACITY: usize = 10_000;

// Amount consumed per bucket index.
type Buckets = BTreeMap<u64, u64>;

/// Counters held in the process. Accurate, but not shared between
/// instances.
pub struct InMemoryStorage {
    counters: RwLock<TtlCache<String, Buckets>>,
}

impl CounterStorage for InMemoryStorage {
    fn get_usage(&self, counter: &Counter) -> Result<u64, StorageErr> {
        let counters = self.read()?;
        Ok(counters
            .get(&key_for_counter(counter))
            .map(|buckets| Self::used(buckets, counter))
            .unwrap_or(0))
    }

    fn check_and_update(
        &self,
        counter: &Counter,
        delta: u64,
        best_effort: bool,
    ) -> Result<Authorization, StorageErr> {
        // Holding the write lock makes the check + update atomic
        let mut counters = self.write()?;
        let key = key_for_counter(counter);
        let window = counter.window();

        let mut buckets = counters.remove(&key).unwrap_or_default();
        // Buckets past the current one come from another bucket duration
        buckets.retain(|bucket, _| (window.first..=window.current).contains(bucket));

        let authorization = authorize(
            counter.max_amount(),
            Self::used(&buckets, counter),
            delta,
            best_effort,
        );
        if let Authorization::Ok { granted, .. } = authorization {
            if granted > 0 {
                *buckets.entry(window.current).or_default() += granted;
            }
        }

        if !buckets.is_empty() {
            counters.insert(key, buckets, window.ttl);
        }

        Ok(authorization)
    }

    fn clear(&self) -> Result<(), StorageErr> {
        self.write()?.clear();
        Ok(())
    }
}

impl InMemoryStorage {
    /// `capacity` bounds the number of counters held. When full, the
    /// oldest counter is dropped even if its window is still open, so size
    /// it for every counter that can be active at once: one per quota and
    /// one per override, twice for fixed windows around a boundary.
    pub fn new(capacity: usize) -> Self {
        Self {
            counters: RwLock::new(TtlCache::new(capacity)),
        }
    }

    fn used(buckets: &Buckets, counter: &Counter) -> u64 {
        let window = counter.window();
        buckets
            .range(window.first..=window.current)
            .map(|(_, amount)| amount)
            .sum()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, TtlCache<String, Buckets>>, StorageErr> {
        self.counters
            .read()
            .map_err(|_| StorageErr::new("in-memory counters lock poisoned", false))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, TtlCache<String, Buckets>>, StorageErr> {
        self.counters
            .write()
            .map_err(|_| StorageErr::new("in-memory counters lock poisoned", false))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
