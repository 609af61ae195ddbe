//! Print the records held on each side.

use anyhow::{Context, Result};
use poster_sync_client::RecordStore;
use poster_sync_core::Role;
use poster_sync_types::Request;
use serde::Serialize;
use std::path::Path;

use super::open_store;
use crate::config::Config;

/// One record as printed by `list --json`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListedRequest {
    /// Which store the record came from.
    pub role: String,
    /// Request id.
    pub id: String,
    /// Label.
    pub label: String,
    /// Lifecycle state.
    pub state: String,
    /// Creation time, ms since the epoch.
    pub submitted_at: u64,
    /// Fulfilment time, ms since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<u64>,
    /// Whether the peer has confirmed the current state.
    pub synced: bool,
}

impl ListedRequest {
    fn new(role: Role, request: &Request) -> Self {
        Self {
            role: role.to_string(),
            id: request.id().to_string(),
            label: request.label().to_string(),
            state: request.state().to_string(),
            submitted_at: request.submitted_at().as_millis(),
            fulfilled_at: request.fulfilled_at().map(|t| t.as_millis()),
            synced: request.is_synced(),
        }
    }
}

/// Read the records of `roles`, oldest first within each role.
pub async fn collect(config: &Config, data_dir: &Path, roles: &[Role]) -> Result<Vec<ListedRequest>> {
    let mut listed = Vec::new();
    for &role in roles {
        let store = open_store(config, data_dir, role).await?;
        let records = store
            .all()
            .await
            .with_context(|| format!("Failed to read the {role} store"))?;
        listed.extend(records.iter().map(|r| ListedRequest::new(role, r)));
    }
    Ok(listed)
}

/// Run the list command.
pub async fn run(config: &Config, data_dir: &Path, role: Option<Role>, json: bool) -> Result<()> {
    let roles = match role {
        Some(role) => vec![role],
        None => vec![Role::Originator, Role::Authority],
    };
    let listed = collect(config, data_dir, &roles).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return Ok(());
    }

    print_table(&listed, &roles);
    Ok(())
}

/// Human-readable listing, grouped by role.
pub fn print_table(listed: &[ListedRequest], roles: &[Role]) {
    for role in roles {
        let role = role.to_string();
        let rows: Vec<_> = listed.iter().filter(|r| r.role == role).collect();
        println!("{} ({} records):", role, rows.len());
        for row in rows {
            println!(
                "  {}  {:<12} {:<16} {}",
                row.id,
                row.state,
                row.label,
                if row.synced { "synced" } else { "pending" }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poster_sync_types::Timestamp;
    use tempfile::tempdir;

    #[tokio::test]
    async fn collect_reads_both_sides() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let originator = open_store(&config, dir.path(), Role::Originator)
            .await
            .unwrap();
        let authority = open_store(&config, dir.path(), Role::Authority)
            .await
            .unwrap();
        let request = Request::submit("A42", Timestamp::from_millis(5));
        originator.put(&request).await.unwrap();
        authority.put(&request.clone().synced()).await.unwrap();

        let listed = collect(&config, dir.path(), &[Role::Originator, Role::Authority])
            .await
            .unwrap();

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].role, "originator");
        assert!(!listed[0].synced);
        assert_eq!(listed[1].role, "authority");
        assert!(listed[1].synced);
        assert_eq!(listed[1].state, "submitted");
        assert_eq!(listed[1].submitted_at, 5);
    }

    #[test]
    fn json_uses_camel_case_and_skips_missing_fulfilment() {
        let request = Request::submit("A42", Timestamp::from_millis(5));
        let json = serde_json::to_value(ListedRequest::new(Role::Originator, &request)).unwrap();

        assert_eq!(json["submittedAt"], 5);
        assert_eq!(json["state"], "submitted");
        assert!(json.get("fulfilledAt").is_none());
    }
}
