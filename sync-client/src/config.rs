//! Engine configuration.

use poster_sync_core::{LinkPolicy, RetryPolicy, Role};
use std::time::Duration;

/// Configuration for a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Which side of the protocol this device plays.
    pub role: Role,
    /// Inactivity window after which buffered fragments form one message.
    pub quiescence_window: Duration,
    /// Transmission attempts, including the first.
    pub retry_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Minimum time in `Negotiating` before subscribing.
    pub subscribe_settle_delay: Duration,
    /// Delay from handshake start before the originator reads full state.
    pub full_state_delay: Duration,
    /// Unit size requested during negotiation.
    pub preferred_unit_size: usize,
    /// Smallest negotiated unit size the engine accepts.
    pub min_unit_size: usize,
    /// Wait before retrying after establish or negotiation failed.
    pub reconnect_backoff: Duration,
    /// Wait between losing the link and starting recovery.
    pub recover_delay: Duration,
}

impl SyncConfig {
    /// Create a configuration with default timings for `role`.
    pub fn new(role: Role) -> Self {
        let link = LinkPolicy::default();
        Self {
            role,
            quiescence_window: Duration::from_secs(1),
            retry_attempts: RetryPolicy::DEFAULT_ATTEMPTS,
            retry_delay: RetryPolicy::DEFAULT_DELAY,
            subscribe_settle_delay: link.settle_delay,
            full_state_delay: Duration::from_secs(3),
            preferred_unit_size: link.preferred_unit_size,
            min_unit_size: link.min_unit_size,
            reconnect_backoff: link.reconnect_backoff,
            recover_delay: link.recover_delay,
        }
    }

    /// Defaults for the request-creating side.
    pub fn originator() -> Self {
        Self::new(Role::Originator)
    }

    /// Defaults for the queue-holding side.
    pub fn authority() -> Self {
        Self::new(Role::Authority)
    }

    /// Set the reassembly quiescence window.
    pub fn with_quiescence_window(mut self, window: Duration) -> Self {
        self.quiescence_window = window;
        self
    }

    /// Set the retry budget.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// Set the settling delay before subscribing.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.subscribe_settle_delay = delay;
        self
    }

    /// Set the full-state read delay.
    pub fn with_full_state_delay(mut self, delay: Duration) -> Self {
        self.full_state_delay = delay;
        self
    }

    /// Set the requested and minimum unit sizes.
    pub fn with_unit_sizes(mut self, preferred: usize, min: usize) -> Self {
        self.preferred_unit_size = preferred;
        self.min_unit_size = min;
        self
    }

    /// Set the back-off after a failed connection attempt.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay)
    }

    /// Minimum silence after a write before the next write on the same
    /// channel.
    ///
    /// The peer splits messages on quiescence, so this is the window plus
    /// half again to stay clear of the peer's timer edge.
    pub fn write_spacing(&self) -> Duration {
        self.quiescence_window + self.quiescence_window / 2
    }

    /// Link policy derived from this configuration.
    pub fn link_policy(&self) -> LinkPolicy {
        LinkPolicy {
            preferred_unit_size: self.preferred_unit_size,
            min_unit_size: self.min_unit_size,
            settle_delay: self.subscribe_settle_delay,
            reconnect_backoff: self.reconnect_backoff,
            recover_delay: self.recover_delay,
        }
    }
}
