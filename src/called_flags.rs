use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

/// Remembers which (flag, value) pairs each subject has been reported for, so that
/// `$feature_flag_called` is sent at most once per combination.
///
/// Bounded by the number of subjects. When full, everything is forgotten at once.
#[derive(Debug)]
pub(crate) struct CalledFlags {
    seen: Mutex<HashMap<String, HashSet<String>>>,
    max_subjects: usize,
}

impl CalledFlags {
    pub(crate) const DEFAULT_MAX_SUBJECTS: usize = 50_000;

    pub(crate) fn new(max_subjects: usize) -> CalledFlags {
        CalledFlags {
            seen: Mutex::new(HashMap::new()),
            max_subjects: max_subjects.max(1),
        }
    }

    /// Record a report for `distinct_id`. Returns `true` the first time a combination is seen.
    pub(crate) fn first_call(&self, distinct_id: &str, flag_key: &str, value: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        if !seen.contains_key(distinct_id) && seen.len() >= self.max_subjects {
            log::debug!(target: "posthog", "clearing reported feature flag calls");
            seen.clear();
        }

        seen.entry(distinct_id.to_owned())
            .or_default()
            .insert(format!("{flag_key}_{value}"))
    }
}

impl Default for CalledFlags {
    fn default() -> CalledFlags {
        CalledFlags::new(CalledFlags::DEFAULT_MAX_SUBJECTS)
    }
}
