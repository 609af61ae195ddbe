//! Write pacing.
//!
//! The link carries no message framing: the receiver treats a stretch of
//! silence as the end of a message. Consecutive writes on one channel are
//! therefore held apart by at least the peer's quiescence window.

use poster_sync_types::Channel;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Tracks the last write per channel and delays the next one.
#[derive(Debug, Clone)]
pub struct WritePacer {
    spacing: Duration,
    last_write: Arc<Mutex<HashMap<Channel, Instant>>>,
}

impl WritePacer {
    /// Keep writes on a channel at least `spacing` apart.
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_write: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait until `channel` has been quiet for the full spacing.
    pub async fn ready(&self, channel: Channel) {
        let due = self
            .last_write
            .lock()
            .await
            .get(&channel)
            .map(|last| *last + self.spacing);
        if let Some(due) = due {
            if due > Instant::now() {
                trace!(%channel, wait = ?(due - Instant::now()), "pacing write");
                sleep_until(due).await;
            }
        }
    }

    /// Note that a write on `channel` just finished, successful or not.
    pub async fn wrote(&self, channel: Channel) {
        self.last_write.lock().await.insert(channel, Instant::now());
    }
}
