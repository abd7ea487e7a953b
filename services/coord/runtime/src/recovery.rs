//! Recovery policy for faulting execution units

use crate::IsolateError;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Guards deciding whether a faulted unit is restarted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Restarts allowed over the lifetime of a unit
    pub max_attempts: u32,
    /// Errors tolerated inside `error_window` (restart only while below)
    pub max_errors_in_window: usize,
    /// Trailing window for error counting
    pub error_window: Duration,
    /// Base of the exponential backoff
    pub base_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_errors_in_window: 5,
            error_window: Duration::from_secs(60),
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RecoveryPolicy {
    /// Backoff before recovery `attempt` (1-based): `base * 2^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(20))
    }
}

/// Sliding window of error timestamps
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    window: Duration,
    errors: VecDeque<Instant>,
}

impl ErrorWindow {
    /// Create a window of length `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            errors: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.errors.front() {
            if now.saturating_duration_since(*first) > self.window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an error at `now` and return how many fall inside the window
    pub fn record(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.errors.push_back(now);
        self.errors.len()
    }

    /// Errors inside the window ending at `now`
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.errors.len()
    }
}

/// Outcome of a fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Restart after `delay`
    Retry {
        /// 1-based recovery attempt
        attempt: u32,
        /// Backoff before the restart
        delay: Duration,
    },
    /// Give up on the unit
    Disable {
        /// Which guard refused recovery
        reason: String,
    },
}

/// Per-unit fault bookkeeping
#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    policy: RecoveryPolicy,
    attempts: u32,
    window: ErrorWindow,
}

impl RecoveryTracker {
    /// Create a tracker applying `policy`
    pub fn new(policy: RecoveryPolicy) -> Self {
        let window = ErrorWindow::new(policy.error_window);
        Self {
            policy,
            attempts: 0,
            window,
        }
    }

    /// Recoveries attempted so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decide what to do about `error`
    pub fn on_error(&mut self, error: &IsolateError) -> RecoveryDecision {
        let recent = self.window.record(Instant::now());

        let refusal = if error.fatal {
            Some(format!("fatal error: {}", error))
        } else if self.attempts >= self.policy.max_attempts {
            Some(format!(
                "recovery attempts exhausted ({}): {}",
                self.policy.max_attempts, error
            ))
        } else if recent >= self.policy.max_errors_in_window {
            Some(format!(
                "{} errors within {:?}: {}",
                recent, self.policy.error_window, error
            ))
        } else {
            None
        };

        if let Some(reason) = refusal {
            warn!("Recovery refused: {}", reason);
            return RecoveryDecision::Disable { reason };
        }

        self.attempts += 1;
        let delay = self.policy.delay_for(self.attempts);
        debug!(
            "Recovery attempt {} scheduled in {:?} after: {}",
            self.attempts, delay, error
        );
        RecoveryDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let mut tracker = RecoveryTracker::new(RecoveryPolicy::default());
        let error = IsolateError::new("boom");

        for attempt in 1..=3 {
            assert_eq!(
                tracker.on_error(&error),
                RecoveryDecision::Retry {
                    attempt,
                    delay: Duration::from_secs(1 << attempt)
                }
            );
            tokio::time::advance(Duration::from_secs(30)).await;
        }
        assert!(matches!(tracker.on_error(&error), RecoveryDecision::Disable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_never_retried() {
        let mut tracker = RecoveryTracker::new(RecoveryPolicy::default());
        assert!(matches!(
            tracker.on_error(&IsolateError::fatal("corrupt")),
            RecoveryDecision::Disable { .. }
        ));
        assert_eq!(tracker.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_guard() {
        let policy = RecoveryPolicy {
            max_attempts: 100,
            ..RecoveryPolicy::default()
        };
        let mut tracker = RecoveryTracker::new(policy);
        let error = IsolateError::new("flaky");

        for _ in 0..4 {
            assert!(matches!(tracker.on_error(&error), RecoveryDecision::Retry { .. }));
        }
        // Fifth error inside the window
        assert!(matches!(tracker.on_error(&error), RecoveryDecision::Disable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_window_slides() {
        let mut window = ErrorWindow::new(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(window.record(start), 1);
        assert_eq!(window.record(start + Duration::from_secs(30)), 2);
        assert_eq!(window.count(start + Duration::from_secs(61)), 1);
        assert_eq!(window.count(start + Duration::from_secs(91)), 0);
    }
}
