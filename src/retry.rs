//! Retry policy and per-resource reconcile records.
//!
//! Failed reconciles requeue with exponential backoff and full jitter.
//! Transient errors cap at seconds; unreachable hosts use a separate,
//! much longer cap. Attempt counts live in a process-wide record store
//! keyed by `namespace/name`, reset on success.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::Disposition;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: f64,
    base: f64,
    cap: f64,
    slow_cap: f64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: config.initial_delay_secs,
            base: config.exponential_base,
            cap: config.max_delay_secs,
            slow_cap: config.unreachable_max_delay_secs,
            max_attempts: config.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), jittered into
    /// `[0.5d, 1.5d]` to spread synchronized failures.
    pub fn delay(&self, attempt: u32, disposition: Disposition) -> Duration {
        let cap = match disposition {
            Disposition::RetrySlow => self.slow_cap,
            _ => self.cap,
        };
        let exponent = attempt.saturating_sub(1).min(30);
        let raw = (self.initial * self.base.powi(exponent as i32)).min(cap);
        let jittered = raw * (0.5 + rand::rng().random::<f64>());
        Duration::from_secs_f64(jittered)
    }
}

/// Engine-internal state for one NixosConfiguration.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// Most recent computed fingerprint.
    pub fingerprint: Option<String>,
    /// Consecutive failed attempts since the last success.
    pub retries: u32,
    /// Whether the deletion tear-down has already been attempted.
    pub teardown_attempted: bool,
}

/// Process-wide record store keyed by `namespace/name`.
#[derive(Default)]
pub struct Records {
    inner: Mutex<HashMap<String, Record>>,
}

impl Records {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Record {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update(&self, key: &str, f: impl FnOnce(&mut Record)) -> Record {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.entry(key.to_string()).or_default();
        f(record);
        record.clone()
    }

    /// Bump the failure counter and return the new attempt number.
    pub fn record_failure(&self, key: &str) -> u32 {
        self.update(key, |r| r.retries += 1).retries
    }

    /// Reset the failure counter and remember the applied fingerprint.
    pub fn record_success(&self, key: &str, fingerprint: &str) {
        self.update(key, |r| {
            r.retries = 0;
            r.fingerprint = Some(fingerprint.to_string());
        });
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(&RetryConfig {
            max_attempts: 3,
            initial_delay_secs: 2.0,
            max_delay_secs: 30.0,
            unreachable_max_delay_secs: 300.0,
            exponential_base: 2.0,
        })
    }

    #[test]
    fn delay_grows_and_caps_within_jitter_bounds() {
        let backoff = backoff();
        for (attempt, raw) in [(1u32, 2.0f64), (2, 4.0), (3, 8.0), (5, 30.0), (10, 30.0)] {
            let delay = backoff.delay(attempt, Disposition::Retry).as_secs_f64();
            assert!(
                delay >= raw * 0.5 && delay <= raw * 1.5,
                "attempt {attempt}: {delay} outside [{}, {}]",
                raw * 0.5,
                raw * 1.5
            );
        }
    }

    #[test]
    fn unreachable_uses_the_longer_cap() {
        let backoff = backoff();
        // attempt 10 raw = 2 * 2^9 = 1024, capped at 300 for slow
        let delay = backoff.delay(10, Disposition::RetrySlow).as_secs_f64();
        assert!(delay >= 150.0 && delay <= 450.0);
    }

    #[test]
    fn records_reset_on_success() {
        let records = Records::new();
        assert_eq!(records.record_failure("ns/c1"), 1);
        assert_eq!(records.record_failure("ns/c1"), 2);
        records.record_success("ns/c1", "abc123");
        let record = records.get("ns/c1");
        assert_eq!(record.retries, 0);
        assert_eq!(record.fingerprint.as_deref(), Some("abc123"));
    }

    #[test]
    fn records_are_isolated_per_key() {
        let records = Records::new();
        records.record_failure("ns/c1");
        assert_eq!(records.get("ns/c2").retries, 0);
        records.remove("ns/c1");
        assert_eq!(records.get("ns/c1").retries, 0);
    }
}
