//! Restart policy for a crashing worker.

use std::time::Duration;

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff without jitter, so delays never decrease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first restart.
    pub base: Duration,

    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(5 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before restart attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed before the supervisor gives up.
    pub max_attempts: u32,

    /// A child that stayed up this long resets the attempt counter.
    pub stable_uptime: Duration,

    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            stable_uptime: Duration::from_secs(10 * 60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What to do after the child exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Counts consecutive crashes against a [`RestartPolicy`].
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    attempts: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Records an unexpected exit after `uptime` and decides what happens next.
    pub fn on_exit(&mut self, uptime: Duration) -> RestartDecision {
        if uptime >= self.policy.stable_uptime {
            self.attempts = 0;
        }
        if self.attempts >= self.policy.max_attempts {
            return RestartDecision::GiveUp {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        RestartDecision::Restart {
            attempt: self.attempts,
            delay: self.policy.backoff.delay(self.attempts),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_delays() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(9), Duration::from_secs(300));
        assert_eq!(backoff.delay(200), Duration::from_secs(300));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut tracker = RestartTracker::new(RestartPolicy::default());
        for attempt in 1..=5 {
            assert!(matches!(
                tracker.on_exit(Duration::from_secs(1)),
                RestartDecision::Restart { attempt: a, .. } if a == attempt
            ));
        }
        assert_eq!(
            tracker.on_exit(Duration::from_secs(1)),
            RestartDecision::GiveUp { attempts: 5 }
        );
    }

    #[test]
    fn test_stable_uptime_resets_counter() {
        let mut tracker = RestartTracker::new(RestartPolicy::default());
        tracker.on_exit(Duration::ZERO);
        tracker.on_exit(Duration::ZERO);
        assert_eq!(tracker.attempts(), 2);

        let decision = tracker.on_exit(Duration::from_secs(11 * 60));
        assert_eq!(
            decision,
            RestartDecision::Restart {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
    }

    proptest! {
        #[test]
        fn prop_restarts_bounded_and_delays_non_decreasing(
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
            max_attempts in 0u32..20,
            exits in 1usize..60,
        ) {
            let policy = RestartPolicy {
                max_attempts,
                stable_uptime: Duration::from_secs(3600),
                backoff: BackoffPolicy {
                    base: Duration::from_millis(base_ms),
                    max: Duration::from_millis(max_ms),
                },
            };
            let mut tracker = RestartTracker::new(policy);

            let mut restarts = 0;
            let mut last = Duration::ZERO;
            for _ in 0..exits {
                match tracker.on_exit(Duration::from_millis(10)) {
                    RestartDecision::Restart { delay, .. } => {
                        prop_assert!(delay >= last);
                        prop_assert!(delay <= Duration::from_millis(max_ms));
                        last = delay;
                        restarts += 1;
                    }
                    RestartDecision::GiveUp { .. } => break,
                }
            }
            prop_assert!(restarts <= max_attempts);
        }
    }
}
