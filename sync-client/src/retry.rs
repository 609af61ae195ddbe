//! Async execution of the retry policy.
//!
//! Every attempt and every wait between attempts races the link watch: the
//! moment the link leaves `Ready` the run stops with
//! [`RetryOutcome::LinkLost`] instead of burning the remaining attempts on a
//! dead link.

use poster_sync_core::{RetryDecision, RetryOutcome, RetryPolicy};
use std::future::Future;
use tokio::sync::watch;
use tracing::debug;

use crate::transport::TransportError;

/// Runs fallible link operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    link: watch::Receiver<bool>,
}

impl Retrier {
    /// Create a retrier. `link` is `true` while the link is `Ready`.
    pub fn new(policy: RetryPolicy, link: watch::Receiver<bool>) -> Self {
        Self { policy, link }
    }

    /// The policy in force.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Check if the link is currently up.
    pub fn link_up(&self) -> bool {
        *self.link.borrow()
    }

    /// Resolve once the link is down.
    pub async fn link_lost(&self) {
        link_down(&mut self.link.clone()).await
    }

    /// Run `op` until it succeeds, the budget runs out or the link drops.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut link = self.link.clone();
        let mut attempt = 0;

        loop {
            if !*link.borrow_and_update() {
                return RetryOutcome::LinkLost { attempts: attempt };
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = link_down(&mut link) => return RetryOutcome::LinkLost { attempts: attempt },
                result = op() => result,
            };

            let error = match result {
                Ok(value) => {
                    return RetryOutcome::Delivered {
                        attempts: attempt,
                        value,
                    }
                }
                Err(e) if e.is_link_loss() => return RetryOutcome::LinkLost { attempts: attempt },
                Err(e) => e,
            };

            match self.policy.after_failure(attempt) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(attempt, error = %error, ?delay, "attempt failed, retrying");
                    tokio::select! {
                        biased;
                        _ = link_down(&mut link) => {
                            return RetryOutcome::LinkLost { attempts: attempt }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    }
                }
            }
        }
    }
}

/// Resolve once the link is down (or its owner is gone).
pub(crate) async fn link_down(link: &mut watch::Receiver<bool>) {
    let _ = link.wait_for(|up| !*up).await;
}
