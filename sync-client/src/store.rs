//! Record store for poster-sync.
//!
//! The store is the durable source of truth on each device and the only
//! mutable state shared between the session task and the read-request
//! path. Every `put` is an atomic per-record upsert that is durable before
//! it returns.

use async_trait::async_trait;
use poster_sync_types::{Request, RequestId, RequestState};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored row cannot be turned back into a request.
    #[error("corrupt record {id}: {reason}")]
    Corrupt {
        /// Row identifier as stored.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Schema setup failed.
    #[error("migration error: {0}")]
    Migration(String),
}

/// Trait for request storage backends.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get one request by id.
    async fn get(&self, id: RequestId) -> Result<Option<Request>, StoreError>;

    /// Insert or replace a request, keyed by id.
    async fn put(&self, request: &Request) -> Result<(), StoreError>;

    /// Every request, ordered by submission time.
    async fn all(&self) -> Result<Vec<Request>, StoreError>;

    /// Requests in `state`, ordered by submission time.
    async fn all_with_state(&self, state: RequestState) -> Result<Vec<Request>, StoreError>;

    /// Unsynced requests in `state`, ordered by submission time.
    async fn all_unsynced(&self, state: RequestState) -> Result<Vec<Request>, StoreError>;

    /// Number of requests the peer has not confirmed yet.
    async fn unsynced_count(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for state in RequestState::ALL {
            count += self.all_unsynced(state).await?.len();
        }
        Ok(count)
    }
}

/// In-memory store for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RequestId, Request>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn select(&self, keep: impl Fn(&Request) -> bool) -> Vec<Request> {
        let records = self.records.read().await;
        let mut selected: Vec<Request> = records.values().filter(|r| keep(r)).cloned().collect();
        selected.sort_by_key(|r| (r.submitted_at(), r.id()));
        selected
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn put(&self, request: &Request) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(request.id(), request.clone());
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Request>, StoreError> {
        Ok(self.select(|_| true).await)
    }

    async fn all_with_state(&self, state: RequestState) -> Result<Vec<Request>, StoreError> {
        Ok(self.select(|r| r.state() == state).await)
    }

    async fn all_unsynced(&self, state: RequestState) -> Result<Vec<Request>, StoreError> {
        Ok(self.select(|r| r.state() == state && !r.is_synced()).await)
    }

    async fn unsynced_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| !r.is_synced())
            .count())
    }
}
