//! Linear retry policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::defaults::{LEASE_RETRY_MAX, LEASE_RETRY_STEP};

/// Linear backoff: the wait before attempt `n` is `step * n`, capped at `max`.
///
/// The policy is passed explicitly to every operation that retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearRetry {
    /// Backoff increment per attempt
    #[serde(with = "duration_millis")]
    pub step: Duration,

    /// Maximum single wait
    #[serde(with = "duration_millis")]
    pub max: Duration,
}

impl LinearRetry {
    /// Create a new linear retry policy
    pub fn new(step: Duration, max: Duration) -> Self {
        Self { step, max }
    }

    /// Wait duration before the given attempt (1-based)
    pub fn duration(&self, attempt: u32) -> Duration {
        let wait = self.step.saturating_mul(attempt);
        wait.min(self.max)
    }
}

impl Default for LinearRetry {
    fn default() -> Self {
        Self::new(LEASE_RETRY_STEP, LEASE_RETRY_MAX)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 500)]
    #[case(2, 1000)]
    #[case(3, 1500)]
    #[case(10, 2000)]
    fn test_linear_durations(#[case] attempt: u32, #[case] expected_ms: u64) {
        let retry = LinearRetry::new(Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(retry.duration(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_default_policy_is_one_second_fixed() {
        let retry = LinearRetry::default();
        assert_eq!(retry.duration(1), Duration::from_secs(1));
        assert_eq!(retry.duration(5), Duration::from_secs(1));
    }

    #[test]
    fn test_serde_millis() {
        let retry = LinearRetry::new(Duration::from_millis(250), Duration::from_secs(1));
        let json = serde_json::to_string(&retry).unwrap();
        assert_eq!(json, r#"{"step":250,"max":1000}"#);
        let back: LinearRetry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, retry);
    }
}
