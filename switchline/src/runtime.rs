//! Runtime feature snapshot.
//!
//! A flat key/value view consulted on the hot path for tunables
//! (`upstream.healthy_panic_threshold`, `upstream.base_retry_backoff_ms`,
//! ...) and percentage feature gates (`upstream.use_retry`). Values come
//! from the bootstrap config; absent keys fall back to the caller's
//! default.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::Rng;

/// Cheap to clone: the key/value table is shared.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    values: Arc<HashMap<String, u64>>,
}

impl Snapshot {
    pub fn new(values: HashMap<String, u64>) -> Snapshot {
        Snapshot {
            values: Arc::new(values),
        }
    }

    /// Integer value for `key`, or `default` if unset.
    pub fn get_integer(&self, key: &str, default: u64) -> u64 {
        self.values.get(key).copied().unwrap_or(default)
    }

    /// Percentage gate: true for `value`% of calls (random sampling).
    pub fn feature_enabled(&self, key: &str, default_percent: u64, rng: &mut SmallRng) -> bool {
        let percent = self.get_integer(key, default_percent).min(100);
        rng.gen_range(0..100) < percent
    }

    /// Percentage gate with a stable seed: true when
    /// `seed % buckets < value`. Used where a request must sample
    /// consistently (shadow policies keyed by stream id).
    pub fn feature_enabled_seeded(
        &self,
        key: &str,
        default_value: u64,
        seed: u64,
        buckets: u64,
    ) -> bool {
        let value = self.get_integer(key, default_value).min(buckets);
        seed % buckets < value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn integers_fall_back_to_default() {
        let snapshot = Snapshot::new(HashMap::from([("a.b".to_string(), 7u64)]));
        assert_eq!(snapshot.get_integer("a.b", 1), 7);
        assert_eq!(snapshot.get_integer("a.c", 1), 1);
    }

    #[test]
    fn zero_and_hundred_percent_gates() {
        let snapshot = Snapshot::new(HashMap::from([
            ("on".to_string(), 100u64),
            ("off".to_string(), 0u64),
        ]));
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..100 {
            assert!(snapshot.feature_enabled("on", 0, &mut rng));
            assert!(!snapshot.feature_enabled("off", 100, &mut rng));
        }
    }

    #[test]
    fn seeded_gate_is_stable() {
        let snapshot = Snapshot::new(HashMap::from([("k".to_string(), 5000u64)]));
        let a = snapshot.feature_enabled_seeded("k", 0, 1234, 10000);
        let b = snapshot.feature_enabled_seeded("k", 0, 1234, 10000);
        assert_eq!(a, b);
        assert!(snapshot.feature_enabled_seeded("k", 0, 4999, 10000));
        assert!(!snapshot.feature_enabled_seeded("k", 0, 5000, 10000));
    }
}
