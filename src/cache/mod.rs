//! Flag result caching and the storage backends behind it.
//!
//! [`FlagResultCache`] remembers recent [`FlagDecision`]s so that flags keep being served when
//! neither local nor remote evaluation is possible. Entries live in a [`CacheBackend`]: either the
//! in-process [`MemoryBackend`] or a shared store such as [`RedisBackend`], which also carries the
//! leader-election lock used by [`SharedDefinitions`].
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::flags::{DecisionSource, FlagDecision};
use crate::Result;

mod leader;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use leader::SharedDefinitions;
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Narrow key-value interface a cache store has to provide.
///
/// Values are opaque strings. Lock operations must be atomic with respect to every other client
/// of the same store.
pub trait CacheBackend: Send + Sync {
    /// Get the value stored at `key`, if present and not expired.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` at `key`, expiring after `ttl`.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// List all keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Acquire `lock` for `holder` if it is free, or extend it if `holder` already owns it.
    ///
    /// Returns `true` if `holder` owns the lock for the next `ttl`.
    fn try_acquire_or_extend_lock(&self, lock: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release `lock` if (and only if) `holder` owns it. Returns `true` if it was released.
    fn release_lock(&self, lock: &str, holder: &str) -> Result<bool>;
}

/// Serialized form of a cached decision.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    decision: FlagDecision,
    version: u64,
    timestamp_ms: i64,
}

impl CacheEntry {
    fn is_younger_than(&self, now_ms: i64, age: Duration) -> bool {
        let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.timestamp_ms) < age_ms
    }
}

/// Cache of flag decisions keyed by (subject, flag key, definitions version).
///
/// Backend failures are logged and treated as misses: the cache never fails an evaluation.
pub struct FlagResultCache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    ttl: Duration,
    stale_ttl: Duration,
}

impl FlagResultCache {
    /// Create a cache storing entries under `{namespace}:flags:`.
    ///
    /// Entries are fresh for `ttl` and usable as a last resort for `stale_ttl`.
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        namespace: &str,
        ttl: Duration,
        stale_ttl: Duration,
    ) -> FlagResultCache {
        FlagResultCache {
            backend,
            prefix: format!("{namespace}:flags:"),
            ttl,
            stale_ttl: stale_ttl.max(ttl),
        }
    }

    fn key(&self, subject: &str, flag_key: &str) -> String {
        format!("{}{subject}:{flag_key}", self.prefix)
    }

    fn read(&self, subject: &str, flag_key: &str) -> Option<CacheEntry> {
        let raw = match self.backend.get(&self.key(subject, flag_key)) {
            Ok(raw) => raw?,
            Err(err) => {
                log::warn!(target: "posthog", flag_key, subject; "failed to read flag cache: {err}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::debug!(target: "posthog", flag_key, subject; "ignoring unreadable cache entry: {err}");
                None
            }
        }
    }

    fn lookup(
        &self,
        subject: &str,
        flag_key: &str,
        current_version: u64,
        max_age: Duration,
    ) -> Option<FlagDecision> {
        let entry = self.read(subject, flag_key)?;
        if entry.version != current_version
            || !entry.is_younger_than(Utc::now().timestamp_millis(), max_age)
        {
            return None;
        }
        Some(FlagDecision {
            source: DecisionSource::Cache,
            ..entry.decision
        })
    }

    /// Get a fresh decision computed against `current_version`.
    pub fn get(&self, subject: &str, flag_key: &str, current_version: u64) -> Option<FlagDecision> {
        self.lookup(subject, flag_key, current_version, self.ttl)
    }

    /// Like [`FlagResultCache::get`], but accepts entries past their TTL (up to the stale window).
    pub fn get_stale(
        &self,
        subject: &str,
        flag_key: &str,
        current_version: u64,
    ) -> Option<FlagDecision> {
        self.lookup(subject, flag_key, current_version, self.stale_ttl)
    }

    /// Remember `decision` for `subject`, computed against definitions `version`.
    pub fn set(&self, subject: &str, flag_key: &str, decision: &FlagDecision, version: u64) {
        let entry = CacheEntry {
            decision: decision.clone(),
            version,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        let result = serde_json::to_string(&entry)
            .map_err(crate::Error::from)
            .and_then(|raw| {
                self.backend
                    .set(&self.key(subject, flag_key), &raw, self.stale_ttl)
            });
        if let Err(err) = result {
            log::warn!(target: "posthog", flag_key, subject; "failed to write flag cache: {err}");
        }
    }

    /// Drop every entry computed against `old_version`. Idempotent.
    pub fn invalidate_version(&self, old_version: u64) {
        let keys = match self.backend.keys(&self.prefix) {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!(target: "posthog", old_version; "failed to list flag cache entries: {err}");
                return;
            }
        };

        let mut removed = 0;
        for key in keys {
            let stale = match self.backend.get(&key) {
                Ok(Some(raw)) => serde_json::from_str::<CacheEntry>(&raw)
                    .map_or(true, |entry| entry.version == old_version),
                Ok(None) => false,
                Err(err) => {
                    log::warn!(target: "posthog", key; "failed to read flag cache: {err}");
                    false
                }
            };
            if stale && self.backend.delete(&key).is_ok() {
                removed += 1;
            }
        }

        log::debug!(target: "posthog", old_version, removed; "invalidated flag cache entries");
    }

    /// Drop every entry.
    pub fn clear(&self) {
        match self.backend.keys(&self.prefix) {
            Ok(keys) => {
                for key in keys {
                    if let Err(err) = self.backend.delete(&key) {
                        log::warn!(target: "posthog", key; "failed to delete flag cache entry: {err}");
                    }
                }
            }
            Err(err) => {
                log::warn!(target: "posthog", "failed to clear flag cache: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::flags::{EvaluationReason, FlagValue};

    fn decision(value: impl Into<FlagValue>) -> FlagDecision {
        FlagDecision {
            key: "beta".to_owned(),
            value: value.into(),
            payload: Some(json!({"color": "red"})),
            reason: EvaluationReason::ConditionMatch { condition_index: 0 },
            source: DecisionSource::Local,
        }
    }

    fn cache(ttl: Duration) -> FlagResultCache {
        FlagResultCache::new(
            Arc::new(MemoryBackend::new(100)),
            "test",
            ttl,
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn returns_what_was_stored() {
        let cache = cache(Duration::from_secs(60));
        cache.set("user", "beta", &decision("test"), 1);

        let cached = cache.get("user", "beta", 1).unwrap();
        assert_eq!(cached.value, FlagValue::from("test"));
        assert_eq!(cached.payload, Some(json!({"color": "red"})));
        assert_eq!(cached.source, DecisionSource::Cache);
        assert_eq!(cached.reason, decision("test").reason);

        assert!(cache.get("other-user", "beta", 1).is_none());
        assert!(cache.get("user", "other-flag", 1).is_none());
    }

    #[test]
    fn respects_version() {
        let cache = cache(Duration::from_secs(60));
        cache.set("user", "beta", &decision(true), 1);

        assert!(cache.get("user", "beta", 2).is_none());
        assert!(cache.get_stale("user", "beta", 2).is_none());
    }

    #[test]
    fn stale_entries_outlive_ttl() {
        let cache = cache(Duration::ZERO);
        cache.set("user", "beta", &decision(true), 1);

        assert!(cache.get("user", "beta", 1).is_none());
        assert_eq!(
            cache.get_stale("user", "beta", 1).map(|d| d.value),
            Some(FlagValue::Boolean(true))
        );
    }

    #[test]
    fn invalidate_version_is_idempotent() {
        let cache = cache(Duration::from_secs(60));
        cache.set("a", "beta", &decision(true), 1);
        cache.set("b", "beta", &decision(true), 2);

        cache.invalidate_version(1);
        assert!(cache.get_stale("a", "beta", 1).is_none());
        assert!(cache.get("b", "beta", 2).is_some());

        cache.invalidate_version(1);
        assert!(cache.get("b", "beta", 2).is_some());
    }

    #[test]
    fn clear_removes_everything() {
        let backend = Arc::new(MemoryBackend::new(100));
        backend
            .set("unrelated", "value", Duration::from_secs(60))
            .unwrap();
        let cache = FlagResultCache::new(
            backend.clone(),
            "test",
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        cache.set("a", "beta", &decision(true), 1);
        cache.set("b", "gamma", &decision(false), 1);

        cache.clear();

        assert!(cache.get("a", "beta", 1).is_none());
        assert!(cache.get("b", "gamma", 1).is_none());
        assert_eq!(backend.get("unrelated").unwrap().as_deref(), Some("value"));
    }
}
