//! Retry policy for outbound transmissions.
//!
//! A fixed number of attempts separated by a fixed delay. There is no
//! exponential growth: the link is point-to-point and short range, so a
//! transmission either gets through within a few seconds or the link is
//! effectively gone.

use std::time::Duration;

/// Bounded-attempt, fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Default number of attempts.
    pub const DEFAULT_ATTEMPTS: u32 = 3;
    /// Default delay between attempts.
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

    /// Create a policy. At least one attempt is always made.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Total attempts, including the first.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay between consecutive attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// What to do after attempt number `attempt` (1-based) failed.
    pub fn after_failure(&self, attempt: u32) -> RetryDecision {
        if attempt < self.attempts {
            RetryDecision::RetryAfter(self.delay)
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS, Self::DEFAULT_DELAY)
    }
}

/// Next step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again.
    RetryAfter(Duration),
    /// Budget exhausted.
    GiveUp,
}

/// Result of running a transmission through a [`RetryPolicy`].
///
/// `Exhausted` and `LinkLost` both leave the record unsynced; they are kept
/// apart so logs can tell a rejecting peer from a dead link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// The peer acknowledged the transmission.
    Delivered {
        /// Attempts used, including the successful one.
        attempts: u32,
        /// What the successful attempt returned.
        value: T,
    },
    /// Every attempt failed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: E,
    },
    /// The link left `Ready` before the policy finished.
    LinkLost {
        /// Attempts started before the link went away.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Whether the transmission was acknowledged.
    pub fn is_delivered(&self) -> bool {
        matches!(self, RetryOutcome::Delivered { .. })
    }

    /// Attempts consumed.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Delivered { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::LinkLost { attempts } => *attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_three_attempts_two_seconds_apart() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay(), Duration::from_secs(2));
    }

    #[test]
    fn delay_is_fixed() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.after_failure(1),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.after_failure(2),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
    }

    #[test]
    fn gives_up_after_last_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.after_failure(3), RetryDecision::GiveUp);
        assert_eq!(policy.after_failure(4), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.after_failure(1), RetryDecision::GiveUp);
    }

    #[test]
    fn outcome_helpers() {
        let delivered: RetryOutcome<(), String> = RetryOutcome::Delivered {
            attempts: 2,
            value: (),
        };
        assert!(delivered.is_delivered());
        assert_eq!(delivered.attempts(), 2);

        let lost: RetryOutcome<(), String> = RetryOutcome::LinkLost { attempts: 1 };
        assert!(!lost.is_delivered());

        let exhausted: RetryOutcome<(), String> = RetryOutcome::Exhausted {
            attempts: 3,
            last_error: "nack".to_string(),
        };
        assert_eq!(exhausted.attempts(), 3);
    }
}
