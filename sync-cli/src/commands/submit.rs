//! Create a request on the originator.

use anyhow::{Context, Result};
use poster_sync_client::RecordStore;
use poster_sync_core::Role;
use poster_sync_types::{Request, Timestamp};
use std::path::Path;
use tracing::info;

use super::open_store;
use crate::config::Config;

/// Run the submit command. Returns the stored request.
pub async fn run(config: &Config, data_dir: &Path, label: &str) -> Result<Request> {
    let label = label.trim();
    if label.is_empty() {
        anyhow::bail!("Label must not be empty");
    }

    let store = open_store(config, data_dir, Role::Originator).await?;
    let request = Request::submit(label, Timestamp::now());
    store
        .put(&request)
        .await
        .context("Failed to store request")?;
    info!(id = %request.id(), label, "request submitted");

    println!("Submitted {} ({})", request.label(), request.id());
    println!("It will be sent on the next sync.");
    Ok(request)
}
