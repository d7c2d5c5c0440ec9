use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use super::{CacheStore, StoreError};

/// The default weighted capacity of a [`MemoryStore`], in bytes.
const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

/// The longest time an entry is kept. Longer TTLs are capped to this.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct StoredItem {
    /// The point in time at which this item expires.
    deadline: Instant,
    data: Bytes,
}

/// A [`CacheStore`] living entirely in process memory.
///
/// Entries expire individually after the TTL they were stored with, and the least recently used
/// entries are evicted once the total size of all keys and values exceeds the capacity. This
/// store is always ready.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    cache: moka::sync::Cache<String, StoredItem>,
}

impl MemoryStore {
    /// Creates a new store holding at most `max_capacity` bytes.
    pub fn new(max_capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(max_capacity)
            .name("memocache")
            .expire_after(StoreExpiration)
            // NOTE: keys count towards the weight as well
            .weigher(|key: &String, value: &StoredItem| {
                let size = key.len() + value.data.len();
                size.try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self { cache }
    }

    /// Returns whether a live entry exists under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn is_ready(&self) -> bool {
        true
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.cache.get(key).map(|item| item.data))
    }

    async fn set_with_ttl(&self, key: &str, ttl: Duration, value: Bytes) -> Result<(), StoreError> {
        let now = Instant::now();
        let deadline = now
            .checked_add(ttl.min(MAX_TTL))
            .unwrap_or(now + Duration::from_secs(24 * 60 * 60));
        self.cache.insert(
            key.to_owned(),
            StoredItem {
                deadline,
                data: value,
            },
        );
        Ok(())
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`StoredItem`] deadline as the explicit
/// expiration time.
struct StoreExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed, this will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<String, StoredItem> for StoreExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredItem,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}
