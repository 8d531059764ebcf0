use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;

use super::CacheBackend;
use crate::Result;

/// In-process [`CacheBackend`] built on a `moka` cache.
///
/// Every value expires after the TTL it was written with. Once `max_entries` is reached, `moka`
/// evicts entries based on access frequency and recency. Locks are only visible to users of the
/// same `MemoryBackend` value, which makes it suitable for a single process or for tests.
pub struct MemoryBackend {
    entries: Cache<String, Entry>,
    locks: Mutex<HashMap<String, Lock>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

/// Expires each entry at the TTL passed to [`CacheBackend::set`].
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

#[derive(Debug)]
struct Lock {
    holder: String,
    expires_at: Instant,
}

impl MemoryBackend {
    /// Default value for `max_entries`.
    pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

    /// Create an empty backend holding at most `max_entries` values.
    pub fn new(max_entries: usize) -> MemoryBackend {
        let max_capacity = u64::try_from(max_entries.max(1)).unwrap_or(u64::MAX);
        MemoryBackend {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryTtl)
                .build(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live entries, after pending evictions have been applied.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }

    /// Return `true` if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lock>> {
        // Lock records are replaced whole, so a panic elsewhere doesn't leave them half-written.
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBackend {
    fn default() -> MemoryBackend {
        MemoryBackend::new(MemoryBackend::DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("entries", &self.entries.entry_count())
            .field("max_entries", &self.entries.policy().max_capacity())
            .finish()
    }
}

impl CacheBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.as_ref().clone())
            .collect())
    }

    fn try_acquire_or_extend_lock(&self, lock: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks();
        let now = Instant::now();

        match locks.get(lock) {
            Some(current) if current.expires_at > now && current.holder != holder => Ok(false),
            _ => {
                locks.insert(
                    lock.to_owned(),
                    Lock {
                        holder: holder.to_owned(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    fn release_lock(&self, lock: &str, holder: &str) -> Result<bool> {
        let mut locks = self.locks();
        let now = Instant::now();

        match locks.get(lock) {
            Some(current) if current.holder == holder && current.expires_at > now => {
                locks.remove(lock);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
