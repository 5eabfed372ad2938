use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::schema::{EmergencyPolicy, MAX_LOCKOUT_DURATION_SECS};

/// Lockout thresholds taken from the `emergency` policy section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_failed_attempts: u32,
    pub lockout_duration: Duration,
}

impl From<&EmergencyPolicy> for LockoutPolicy {
    fn from(e: &EmergencyPolicy) -> Self {
        Self {
            max_failed_attempts: e.max_failed_attempts,
            lockout_duration: lockout_span(e.lockout_duration),
        }
    }
}

/// Configs built in code skip validation, so clamp here as well.
fn lockout_span(secs: u64) -> Duration {
    let secs = secs.min(MAX_LOCKOUT_DURATION_SECS);
    Duration::try_seconds(secs as i64).unwrap_or(Duration::MAX)
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    pub locked_out: bool,
    pub recent_failures: usize,
    /// When the newest failure leaves the window; set only when locked out.
    pub locked_until: Option<DateTime<Utc>>,
}

/// Failure timestamps per identifier. Lockout is derived from the window,
/// never stored.
#[derive(Debug, Default)]
pub struct LockoutTracker {
    failures: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl LockoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `now`, prune to twice the lockout duration and evaluate.
    pub fn record_failure(
        &self,
        identifier: &str,
        policy: LockoutPolicy,
        now: DateTime<Utc>,
    ) -> LockoutStatus {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let record = failures.entry(identifier.to_string()).or_default();
        record.push(now);

        let retention_cutoff = cutoff(now, policy.lockout_duration.checked_mul(2));
        record.retain(|t| *t > retention_cutoff);

        let recent_failures = count_recent(record, policy, now);
        let locked_out = recent_failures >= policy.max_failed_attempts as usize;
        LockoutStatus {
            locked_out,
            recent_failures,
            locked_until: locked_out
                .then(|| now.checked_add_signed(policy.lockout_duration))
                .flatten(),
        }
    }

    /// Pure re-evaluation of the window.
    pub fn is_locked_out(&self, identifier: &str, policy: LockoutPolicy, now: DateTime<Utc>) -> bool {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures
            .get(identifier)
            .map(|record| count_recent(record, policy, now) >= policy.max_failed_attempts as usize)
            .unwrap_or(false)
    }

    /// Drop the record after a verified success.
    pub fn clear(&self, identifier: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identifier);
    }
}

fn count_recent(record: &[DateTime<Utc>], policy: LockoutPolicy, now: DateTime<Utc>) -> usize {
    let since = cutoff(now, Some(policy.lockout_duration));
    record.iter().filter(|t| **t > since).count()
}

/// `now - span`, saturating at the earliest representable instant.
fn cutoff(now: DateTime<Utc>, span: Option<Duration>) -> DateTime<Utc> {
    span.and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
