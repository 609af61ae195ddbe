//! Mark a request fulfilled on the authority.

use anyhow::{Context, Result};
use poster_sync_client::RecordStore;
use poster_sync_core::Role;
use poster_sync_types::{Request, RequestId, Timestamp};
use std::path::Path;
use tracing::info;

use super::open_store;
use crate::config::Config;

/// Run the fulfill command. Returns the updated request.
pub async fn run(config: &Config, data_dir: &Path, id: &str) -> Result<Request> {
    let id: RequestId = id
        .parse()
        .with_context(|| format!("Invalid request id: {id}"))?;

    let store = open_store(config, data_dir, Role::Authority).await?;
    let mut request = store
        .get(id)
        .await?
        .with_context(|| format!("No request {id} in the authority store"))?;
    request
        .fulfill(Timestamp::now())
        .with_context(|| format!("Cannot fulfil {id}"))?;
    store.put(&request).await.context("Failed to store request")?;
    info!(%id, "request fulfilled");

    println!("Fulfilled {} ({})", request.label(), request.id());
    Ok(request)
}
