//! Deterministic bucketing of subjects into rollout percentages and variants.
//!
//! Every SDK and the server hash the same way, so independent processes agree on who is in a
//! rollout without talking to each other.
use sha1::{Digest, Sha1};

use super::models::Variant;

/// Maps `(flag key, identifier, salt)` to a value uniformly distributed in `[0, 1)`.
pub trait RolloutHasher {
    /// Hash `identifier` for the flag `flag_key`. Must be a pure function of its inputs.
    fn hash(&self, flag_key: &str, identifier: &str, salt: &str) -> f64;
}

/// The default (and only) hasher used in production.
///
/// Takes the first 15 hex digits of `sha1("{flag_key}.{identifier}{salt}")` and divides by the
/// largest number representable in 15 hex digits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha1Hasher;

const LONG_SCALE: f64 = 0xfffffffffffffff_u64 as f64;

/// Largest `f64` below `1.0`.
const BELOW_ONE: f64 = 1.0 - f64::EPSILON / 2.0;

/// Salt used for variant selection so that variant assignment is independent from the
/// rollout check.
pub(crate) const VARIANT_SALT: &str = "variant";

impl RolloutHasher for Sha1Hasher {
    fn hash(&self, flag_key: &str, identifier: &str, salt: &str) -> f64 {
        let digest = Sha1::digest(format!("{flag_key}.{identifier}{salt}").as_bytes());

        // 15 hex digits are the top 60 bits of the first 8 bytes.
        let prefix = digest[..8]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
            >> 4;

        // The conversion to f64 rounds the largest prefixes up to exactly 1.0.
        (prefix as f64 / LONG_SCALE).min(BELOW_ONE)
    }
}

/// Return `true` if a subject with hash `hash` falls within `rollout_percentage` (0 to 100).
pub(crate) fn in_rollout(hash: f64, rollout_percentage: f64) -> bool {
    hash < rollout_percentage / 100.0
}

/// Pick the variant whose cumulative range contains `hash`.
///
/// Ranges are laid out in definition order, each as wide as its variant's percentage. Returns
/// `None` if `hash` falls past the last range (weights summing to less than 100).
pub(crate) fn select_variant(variants: &[Variant], hash: f64) -> Option<&Variant> {
    let mut range_start = 0.0;
    for variant in variants {
        let range_end = range_start + variant.rollout_percentage.max(0.0) / 100.0;
        if hash >= range_start && hash < range_end {
            return Some(variant);
        }
        range_start = range_end;
    }
    None
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn variants(weights: &[(&str, f64)]) -> Vec<Variant> {
        weights
            .iter()
            .map(|(key, pct)| Variant {
                key: (*key).to_owned(),
                name: None,
                rollout_percentage: *pct,
            })
            .collect()
    }

    #[test]
    fn matches_reference_rollout_results() {
        // Subjects `distinct_id_0..20` against a 45% rollout of "simple-flag".
        let expected = [
            false, true, true, false, true, false, false, true, false, true, false, true, true,
            false, true, false, false, false, true, true,
        ];

        for (i, expected) in expected.into_iter().enumerate() {
            let hash = Sha1Hasher.hash("simple-flag", &format!("distinct_id_{i}"), "");
            assert_eq!(in_rollout(hash, 45.0), expected, "distinct_id_{i}");
        }
    }

    #[test]
    fn matches_reference_variant_results() {
        // Subjects `distinct_id_0..20` against "multivariate-flag" at 55% with five variants.
        let table = variants(&[
            ("first-variant", 50.0),
            ("second-variant", 20.0),
            ("third-variant", 20.0),
            ("fourth-variant", 5.0),
            ("fifth-variant", 5.0),
        ]);
        let expected = [
            Some("second-variant"),
            Some("second-variant"),
            Some("first-variant"),
            None,
            None,
            Some("second-variant"),
            Some("first-variant"),
            None,
            None,
            None,
            Some("first-variant"),
            Some("third-variant"),
            None,
            Some("first-variant"),
            Some("second-variant"),
            Some("first-variant"),
            None,
            None,
            Some("fourth-variant"),
            Some("first-variant"),
        ];

        for (i, expected) in expected.into_iter().enumerate() {
            let id = format!("distinct_id_{i}");
            let result = if in_rollout(Sha1Hasher.hash("multivariate-flag", &id, ""), 55.0) {
                let hash = Sha1Hasher.hash("multivariate-flag", &id, VARIANT_SALT);
                select_variant(&table, hash).map(|v| v.key.as_str())
            } else {
                None
            };
            assert_eq!(result, expected, "{id}");
        }
    }

    #[test]
    fn selects_variant_by_cumulative_range() {
        let table = variants(&[("A", 34.0), ("B", 33.0), ("C", 33.0)]);

        assert_eq!(select_variant(&table, 0.10).map(|v| v.key.as_str()), Some("A"));
        assert_eq!(select_variant(&table, 0.40).map(|v| v.key.as_str()), Some("B"));
        assert_eq!(select_variant(&table, 0.90).map(|v| v.key.as_str()), Some("C"));
    }

    #[test]
    fn hash_past_last_range_selects_nothing() {
        let table = variants(&[("A", 20.0), ("B", 20.0)]);
        assert!(select_variant(&table, 0.5).is_none());
    }

    #[test]
    fn zero_rollout_excludes_everyone() {
        assert!(!in_rollout(0.0, 0.0));
        assert!(in_rollout(BELOW_ONE, 100.0));
    }

    proptest! {
        #[test]
        fn hash_is_deterministic_and_in_unit_interval(key in "[a-z-]{1,20}", id in ".{0,40}") {
            let first = Sha1Hasher.hash(&key, &id, "");
            let second = Sha1Hasher.hash(&key, &id, "");
            prop_assert_eq!(first.to_bits(), second.to_bits());
            prop_assert!((0.0..1.0).contains(&first));
        }

        #[test]
        fn rollout_is_monotonic(id in "[a-zA-Z0-9]{1,24}", p1 in 0.0f64..100.0, delta in 0.0f64..100.0) {
            let p2 = (p1 + delta).min(100.0);
            let hash = Sha1Hasher.hash("monotonic", &id, "");
            prop_assert!(!in_rollout(hash, p1) || in_rollout(hash, p2));
        }

        #[test]
        fn shrinking_earlier_variant_only_moves_subjects_forward(
            id in "[a-zA-Z0-9]{1,24}",
            a in 0.0f64..60.0,
            shrink in 0.0f64..1.0,
            b in 0.0f64..40.0,
        ) {
            let hash = Sha1Hasher.hash("multi", &id, VARIANT_SALT);
            let before = variants(&[("A", a), ("B", b)]);
            let after = variants(&[("A", a * shrink), ("B", b)]);

            let before = select_variant(&before, hash).map(|v| v.key.clone());
            let after = select_variant(&after, hash).map(|v| v.key.clone());

            // Nobody joins A by shrinking it, and nobody assigned to A before is left in two
            // places: they either stay in A or move to a later range (or none).
            if after.as_deref() == Some("A") {
                prop_assert_eq!(before.as_deref(), Some("A"));
            }
        }
    }
}
