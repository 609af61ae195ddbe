//! CLI command implementations.

pub mod fulfill;
pub mod list;
pub mod simulate;
pub mod submit;

use anyhow::{Context, Result};
use poster_sync_core::Role;
use std::path::Path;

use crate::config::Config;
use crate::store::SqliteStore;

/// Open the store for `role`.
pub async fn open_store(config: &Config, data_dir: &Path, role: Role) -> Result<SqliteStore> {
    let path = config.database(role, data_dir);
    SqliteStore::open(&path)
        .await
        .with_context(|| format!("Failed to open {} store at {}", role, path.display()))
}
