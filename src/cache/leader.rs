use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::CacheBackend;
use crate::flags::FlagDefinitionsResponse;

/// Flag definitions shared between SDK instances through a [`CacheBackend`].
///
/// Instances elect a leader with a lock stored in the backend. Only the leader polls the server
/// and publishes what it receives; the others read the published definitions. A leader that stops
/// renewing its lock loses it once the lock TTL elapses, and any instance may take over.
pub struct SharedDefinitions {
    backend: Arc<dyn CacheBackend>,
    instance_id: String,
    lock_key: String,
    definitions_key: String,
    lock_ttl: Duration,
}

impl SharedDefinitions {
    /// How long published definitions are kept.
    pub const DEFINITIONS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Default value for the lock TTL. Must exceed the poll interval.
    pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

    /// Create a participant in the election for `namespace`, with a fresh instance id.
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        namespace: &str,
        lock_ttl: Duration,
    ) -> SharedDefinitions {
        SharedDefinitions {
            backend,
            instance_id: Uuid::new_v4().to_string(),
            lock_key: format!("{namespace}:lock"),
            definitions_key: format!("{namespace}:definitions"),
            lock_ttl,
        }
    }

    /// Identifier this instance holds the lock under.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Acquire or renew leadership. Returns `true` if this instance should fetch definitions.
    ///
    /// If the backend is unreachable every instance fetches for itself.
    pub fn should_fetch(&self) -> bool {
        match self.backend.try_acquire_or_extend_lock(
            &self.lock_key,
            &self.instance_id,
            self.lock_ttl,
        ) {
            Ok(leader) => leader,
            Err(err) => {
                log::warn!(target: "posthog",
                           lock = self.lock_key.as_str();
                           "leader election failed, fetching definitions directly: {err}");
                true
            }
        }
    }

    /// Definitions published by the current leader, if any.
    pub fn get_definitions(&self) -> Option<FlagDefinitionsResponse> {
        let raw = match self.backend.get(&self.definitions_key) {
            Ok(raw) => raw?,
            Err(err) => {
                log::warn!(target: "posthog", "failed to read shared flag definitions: {err}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(definitions) => Some(definitions),
            Err(err) => {
                log::warn!(target: "posthog", "ignoring unreadable shared flag definitions: {err}");
                None
            }
        }
    }

    /// Publish freshly fetched definitions for the other instances.
    pub fn publish(&self, definitions: &FlagDefinitionsResponse) {
        let result = serde_json::to_string(definitions)
            .map_err(crate::Error::from)
            .and_then(|raw| {
                self.backend
                    .set(&self.definitions_key, &raw, SharedDefinitions::DEFINITIONS_TTL)
            });
        if let Err(err) = result {
            log::warn!(target: "posthog", "failed to publish shared flag definitions: {err}");
        }
    }

    /// Give up leadership if this instance holds it.
    pub fn shutdown(&self) {
        match self
            .backend
            .release_lock(&self.lock_key, &self.instance_id)
        {
            Ok(true) => log::debug!(target: "posthog", "released definitions lock"),
            Ok(false) => {}
            Err(err) => {
                log::warn!(target: "posthog", "failed to release definitions lock: {err}");
            }
        }
    }
}
