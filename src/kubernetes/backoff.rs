use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const BASE_MILLIS: u64 = 5;
const CAP_MILLIS: u64 = 1_000_000; // 1000s

/// Per-key exponential backoff: 5ms doubling per consecutive failure up to
/// 1000s. Success resets the key. Shared by a controller's error policy
/// across worker tasks.
#[derive(Default)]
pub struct BackoffTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `key` and return the delay before the next
    /// attempt.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);

        // 5ms << 28 already exceeds the cap, so the shift cannot overflow
        let exponent = (*count - 1).min(28);
        let millis = (BASE_MILLIS << exponent).min(CAP_MILLIS);
        Duration::from_millis(millis)
    }

    /// Clear the failure count after a successful reconcile
    pub fn reset(&self, key: &str) {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        failures.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_from_five_millis() {
        let tracker = BackoffTracker::new();
        assert_eq!(tracker.next_delay("k"), Duration::from_millis(5));
        assert_eq!(tracker.next_delay("k"), Duration::from_millis(10));
        assert_eq!(tracker.next_delay("k"), Duration::from_millis(20));
        assert_eq!(tracker.next_delay("k"), Duration::from_millis(40));
    }

    #[test]
    fn schedule_caps_at_one_thousand_seconds() {
        let tracker = BackoffTracker::new();
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = tracker.next_delay("k");
        }
        assert_eq!(last, Duration::from_secs(1000));
    }

    #[test]
    fn keys_back_off_independently() {
        let tracker = BackoffTracker::new();
        tracker.next_delay("a");
        tracker.next_delay("a");
        assert_eq!(tracker.next_delay("b"), Duration::from_millis(5));
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let tracker = BackoffTracker::new();
        tracker.next_delay("k");
        tracker.next_delay("k");
        tracker.reset("k");
        assert_eq!(tracker.next_delay("k"), Duration::from_millis(5));
    }
}
