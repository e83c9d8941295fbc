//! Per-session circuit breaker over rejection frequency. A session burning
//! its budget on rejected proposals is cut off instead of being allowed to
//! hammer the supervisor in a tight re-plan loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Sliding window over which rejections are counted.
    pub window: Duration,
    /// Rejections tolerated within the window; one more opens the circuit.
    pub max_rejections: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_rejections: 5,
        }
    }
}

/// Opens per session when rejections within the window exceed the threshold.
/// While open, decisions are auto-rejected without rule evaluation; those
/// auto-rejects are not themselves counted, so the circuit closes again once
/// the recorded rejections age out of the window.
pub struct RejectionBreaker {
    config: BreakerConfig,
    rejections: Mutex<HashMap<Uuid, VecDeque<Instant>>>,
}

impl RejectionBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            rejections: Mutex::new(HashMap::new()),
        }
    }

    /// Record a rule-driven rejection for `session_id`.
    pub fn record_rejection(&self, session_id: Uuid, now: Instant) {
        let mut map = self
            .rejections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let window = map.entry(session_id).or_default();
        Self::prune(window, now, self.config.window);
        window.push_back(now);
    }

    /// Whether the circuit is open for `session_id` at `now`.
    pub fn is_open(&self, session_id: Uuid, now: Instant) -> bool {
        let mut map = self
            .rejections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(window) = map.get_mut(&session_id) else {
            return false;
        };
        Self::prune(window, now, self.config.window);
        let count = u32::try_from(window.len()).unwrap_or(u32::MAX);
        count > self.config.max_rejections
    }

    /// Drop a terminated session's history.
    pub fn forget(&self, session_id: Uuid) {
        self.rejections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&session_id);
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) > span {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_rejections: u32, window: Duration) -> RejectionBreaker {
        RejectionBreaker::new(BreakerConfig {
            window,
            max_rejections,
        })
    }

    #[test]
    fn stays_closed_at_the_threshold() {
        let b = breaker(5, Duration::from_secs(60));
        let session = Uuid::new_v4();
        let now = Instant::now();
        for i in 0..5 {
            b.record_rejection(session, now + Duration::from_secs(i));
        }
        assert!(!b.is_open(session, now + Duration::from_secs(5)));
    }

    #[test]
    fn opens_one_past_the_threshold() {
        let b = breaker(5, Duration::from_secs(60));
        let session = Uuid::new_v4();
        let now = Instant::now();
        for i in 0..6 {
            b.record_rejection(session, now + Duration::from_secs(i));
        }
        assert!(b.is_open(session, now + Duration::from_secs(6)));
    }

    #[test]
    fn closes_again_once_rejections_age_out() {
        let b = breaker(2, Duration::from_secs(10));
        let session = Uuid::new_v4();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_rejection(session, now);
        }
        assert!(b.is_open(session, now));
        assert!(!b.is_open(session, now + Duration::from_secs(11)));
    }

    #[test]
    fn sessions_are_isolated() {
        let b = breaker(1, Duration::from_secs(60));
        let noisy = Uuid::new_v4();
        let quiet = Uuid::new_v4();
        let now = Instant::now();
        b.record_rejection(noisy, now);
        b.record_rejection(noisy, now);
        assert!(b.is_open(noisy, now));
        assert!(!b.is_open(quiet, now));
    }

    #[test]
    fn forget_clears_history() {
        let b = breaker(1, Duration::from_secs(60));
        let session = Uuid::new_v4();
        let now = Instant::now();
        b.record_rejection(session, now);
        b.record_rejection(session, now);
        assert!(b.is_open(session, now));
        b.forget(session);
        assert!(!b.is_open(session, now));
    }
}
