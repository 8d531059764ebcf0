//! Tests against a live Redis server. Run with `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`.
#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use posthog::cache::{CacheBackend, FlagResultCache, RedisBackend, SharedDefinitions};
use posthog::{DecisionSource, EvaluationReason, FlagDecision, FlagValue};

fn backend() -> Arc<RedisBackend> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_owned());
    Arc::new(RedisBackend::open(&url).unwrap())
}

fn namespace() -> String {
    format!("posthog-test-{}", uuid::Uuid::new_v4())
}

#[test]
#[ignore = "requires a Redis server"]
fn stores_and_scans_values() {
    let backend = backend();
    let ns = namespace();

    backend
        .set(&format!("{ns}:flags:a"), "1", Duration::from_secs(60))
        .unwrap();
    backend
        .set(&format!("{ns}:flags:b"), "2", Duration::from_secs(60))
        .unwrap();

    assert_eq!(backend.get(&format!("{ns}:flags:a")).unwrap().as_deref(), Some("1"));
    let mut keys = backend.keys(&format!("{ns}:flags:")).unwrap();
    keys.sort();
    assert_eq!(keys, [format!("{ns}:flags:a"), format!("{ns}:flags:b")]);

    backend.delete(&format!("{ns}:flags:a")).unwrap();
    assert_eq!(backend.get(&format!("{ns}:flags:a")).unwrap(), None);
    backend.delete(&format!("{ns}:flags:b")).unwrap();
}

#[test]
#[ignore = "requires a Redis server"]
fn lock_is_exclusive_until_expiry() {
    let backend = backend();
    let lock = format!("{}:lock", namespace());
    let ttl = Duration::from_millis(200);

    assert!(backend.try_acquire_or_extend_lock(&lock, "a", ttl).unwrap());
    assert!(!backend.try_acquire_or_extend_lock(&lock, "b", ttl).unwrap());
    assert!(!backend.release_lock(&lock, "b").unwrap());

    std::thread::sleep(Duration::from_millis(300));
    assert!(backend.try_acquire_or_extend_lock(&lock, "b", ttl).unwrap());
    assert!(backend.release_lock(&lock, "b").unwrap());
}

#[test]
#[ignore = "requires a Redis server"]
fn flag_results_shared_between_instances() {
    let ns = namespace();
    let first = FlagResultCache::new(backend(), &ns, Duration::from_secs(60), Duration::from_secs(60));
    let second = FlagResultCache::new(backend(), &ns, Duration::from_secs(60), Duration::from_secs(60));

    let decision = FlagDecision {
        key: "beta".to_owned(),
        value: FlagValue::from("test"),
        payload: None,
        reason: EvaluationReason::ConditionMatch { condition_index: 0 },
        source: DecisionSource::Local,
    };
    first.set("user", "beta", &decision, 3);

    assert_eq!(second.get("user", "beta", 3).map(|d| d.value), Some(decision.value));
    second.invalidate_version(3);
    assert!(first.get_stale("user", "beta", 3).is_none());
}

#[test]
#[ignore = "requires a Redis server"]
fn single_leader_across_instances() {
    let ns = namespace();
    let a = SharedDefinitions::new(backend(), &ns, Duration::from_secs(60));
    let b = SharedDefinitions::new(backend(), &ns, Duration::from_secs(60));

    assert!(a.should_fetch());
    assert!(!b.should_fetch());
    a.shutdown();
    assert!(b.should_fetch());
    b.shutdown();
}
