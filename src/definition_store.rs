//! A thread-safe in-memory storage for the currently active flag definitions.
//! [`DefinitionStore`] provides concurrent access for readers (flag evaluation on caller threads)
//! and writers (the background poller).
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::flags::{FlagDefinition, FlagDefinitionsResponse, PropertyGroup};

/// An immutable snapshot of flag definitions together with the indexes derived from them.
///
/// Snapshots are never modified in place, only replaced, so a reader holding one sees a
/// consistent definition set for as long as it likes.
#[derive(Debug)]
pub struct FlagDefinitions {
    response: FlagDefinitionsResponse,
    by_key: HashMap<String, usize>,
    version: u64,
    fetched_at: DateTime<Utc>,
}

impl FlagDefinitions {
    pub(crate) fn new(response: FlagDefinitionsResponse, version: u64) -> FlagDefinitions {
        let by_key = response
            .flags
            .iter()
            .enumerate()
            .map(|(i, flag)| (flag.key.clone(), i))
            .collect();
        FlagDefinitions {
            response,
            by_key,
            version,
            fetched_at: Utc::now(),
        }
    }

    /// All flag definitions, in the order served.
    pub fn flags(&self) -> &[FlagDefinition] {
        &self.response.flags
    }

    /// Look up a flag definition by key.
    pub fn get(&self, key: &str) -> Option<&FlagDefinition> {
        self.by_key.get(key).map(|&i| &self.response.flags[i])
    }

    /// Resolve a group type index to a group type name (e.g. `0` to `"company"`).
    pub fn group_type(&self, index: i32) -> Option<&str> {
        self.response
            .group_type_mapping
            .get(&index.to_string())
            .map(String::as_str)
    }

    /// Look up a cohort definition by id.
    pub fn cohort(&self, id: &str) -> Option<&PropertyGroup> {
        self.response.cohorts.get(id)
    }

    /// Version of this definition set. Bumped every time definitions change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When this snapshot was stored.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// The response these definitions were built from.
    pub fn response(&self) -> &FlagDefinitionsResponse {
        &self.response
    }
}

#[derive(Debug, Default)]
struct StoreState {
    current: Option<Arc<FlagDefinitions>>,
    version: u64,
}

/// `DefinitionStore` provides a thread-safe (`Sync`) storage for flag definitions with a
/// monotonically increasing version counter.
#[derive(Debug, Default)]
pub struct DefinitionStore {
    state: RwLock<StoreState>,
}

impl DefinitionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        DefinitionStore::default()
    }

    /// Get currently-active definitions. Returns `None` if definitions haven't been fetched yet
    /// (or have been cleared).
    pub fn get_definitions(&self) -> Option<Arc<FlagDefinitions>> {
        let state = self
            .state
            .read()
            .expect("thread holding definitions lock should not panic");
        state.current.clone()
    }

    /// Version of the currently-active definitions. `0` if nothing has ever been stored.
    pub fn current_version(&self) -> u64 {
        let state = self
            .state
            .read()
            .expect("thread holding definitions lock should not panic");
        state.version
    }

    /// Replace the definitions if `response` differs from the current ones.
    ///
    /// Returns the previous version when the version was bumped, so the caller can invalidate
    /// anything computed against it. Returns `None` if nothing changed.
    pub fn set_definitions(&self, response: FlagDefinitionsResponse) -> Option<u64> {
        let mut state = self
            .state
            .write()
            .expect("thread holding definitions lock should not panic");

        if state
            .current
            .as_ref()
            .is_some_and(|current| current.response == response)
        {
            return None;
        }

        let previous = state.version;
        state.version += 1;
        state.current = Some(Arc::new(FlagDefinitions::new(response, state.version)));
        Some(previous)
    }

    /// Drop all definitions. Bumps the version if anything was stored, returning the previous one.
    pub fn clear(&self) -> Option<u64> {
        let mut state = self
            .state
            .write()
            .expect("thread holding definitions lock should not panic");

        state.current.take()?;
        let previous = state.version;
        state.version += 1;
        Some(previous)
    }
}
