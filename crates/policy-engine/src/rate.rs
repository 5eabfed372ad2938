use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Length of the sliding rate-limit window.
pub const RATE_WINDOW_SECS: i64 = 3600;

/// Outcome of a rate-limited call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCheck {
    /// Recorded; `used` includes this call.
    Allowed { used: usize, limit: u32 },
    /// Not recorded. `retry_at` is when the oldest timestamp leaves the window.
    Exceeded { limit: u32, retry_at: DateTime<Utc> },
}

/// Per-action timestamp windows over the trailing hour.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prune expired timestamps, then either record `now` or refuse.
    pub fn check_and_record(&self, action: &str, limit: u32, now: DateTime<Utc>) -> RateCheck {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(action.to_string()).or_default();
        prune(window, now);

        if window.len() >= limit as usize {
            let retry_at = window
                .front()
                .map(|oldest| *oldest + Duration::seconds(RATE_WINDOW_SECS))
                .unwrap_or(now);
            return RateCheck::Exceeded { limit, retry_at };
        }

        window.push_back(now);
        RateCheck::Allowed {
            used: window.len(),
            limit,
        }
    }

    /// Number of live timestamps for `action`. Does not mutate.
    pub fn count(&self, action: &str, now: DateTime<Utc>) -> usize {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        windows
            .get(action)
            .map(|w| w.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
    while window.front().is_some_and(|t| *t <= cutoff) {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn nth_call_allowed_next_denied() {
        let limiter = RateLimiter::new();
        for i in 0..3 {
            let now = t0() + Duration::seconds(i);
            assert_eq!(
                limiter.check_and_record("send", 3, now),
                RateCheck::Allowed {
                    used: i as usize + 1,
                    limit: 3
                }
            );
        }
        match limiter.check_and_record("send", 3, t0() + Duration::seconds(10)) {
            RateCheck::Exceeded { limit, retry_at } => {
                assert_eq!(limit, 3);
                assert_eq!(retry_at, t0() + Duration::seconds(RATE_WINDOW_SECS));
            }
            other => panic!("expected Exceeded, got {other:?}"),
        }
        // A refused call is not recorded.
        assert_eq!(limiter.count("send", t0() + Duration::seconds(10)), 3);
    }

    #[test]
    fn capacity_recovers_after_oldest_ages_out() {
        let limiter = RateLimiter::new();
        limiter.check_and_record("send", 2, t0());
        limiter.check_and_record("send", 2, t0() + Duration::minutes(30));
        assert!(matches!(
            limiter.check_and_record("send", 2, t0() + Duration::minutes(59)),
            RateCheck::Exceeded { .. }
        ));

        let later = t0() + Duration::seconds(RATE_WINDOW_SECS + 1);
        assert!(matches!(
            limiter.check_and_record("send", 2, later),
            RateCheck::Allowed { used: 2, .. }
        ));
    }

    #[test]
    fn actions_are_tracked_independently() {
        let limiter = RateLimiter::new();
        limiter.check_and_record("a", 1, t0());
        assert!(matches!(
            limiter.check_and_record("b", 1, t0()),
            RateCheck::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_and_record("a", 1, t0()),
            RateCheck::Exceeded { .. }
        ));
        limiter.reset();
        assert_eq!(limiter.count("a", t0()), 0);
    }
}
