//! Run both devices in one process over a loopback link.
//!
//! The originator's store is seeded with new requests, both engines are
//! started against their SQLite stores, and the authority fulfils every
//! request it learns about. The run ends once every record on both sides is
//! `Fulfilled` and synced.

use anyhow::{Context, Result};
use poster_sync_client::{LoopbackTransport, RecordStore, SyncClient};
use poster_sync_core::Role;
use poster_sync_types::{Request, RequestState, Timestamp};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{list, open_store};
use crate::config::Config;
use crate::store::SqliteStore;

/// How often convergence is checked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Options for one simulation run.
#[derive(Debug, Clone, Default)]
pub struct SimulateOptions {
    /// New requests to create on the originator.
    pub requests: usize,
    /// Sever the link this long after start.
    pub drop_after: Option<Duration>,
}

/// Result of a converged run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationSummary {
    /// Records on each side once converged.
    pub records: usize,
    /// Time taken to converge.
    pub elapsed: Duration,
}

/// Run the simulate command.
pub async fn run(config: &Config, data_dir: &Path, options: SimulateOptions) -> Result<SimulationSummary> {
    let originator_store = Arc::new(open_store(config, data_dir, Role::Originator).await?);
    let authority_store = Arc::new(open_store(config, data_dir, Role::Authority).await?);

    for n in 1..=options.requests {
        let request = Request::submit(format!("request-{n}"), Timestamp::now());
        originator_store
            .put(&request)
            .await
            .context("Failed to seed originator store")?;
    }
    info!(requests = options.requests, "originator store seeded");

    let (originator_link, authority_link) = LoopbackTransport::pair_with(config.loopback());
    let control = originator_link.clone();
    let originator = SyncClient::start(
        config.sync_config(Role::Originator),
        Arc::new(originator_link),
        originator_store.clone(),
    )?;
    let authority = SyncClient::start(
        config.sync_config(Role::Authority),
        Arc::new(authority_link),
        authority_store.clone(),
    )?;

    let outage = options.drop_after.map(|after| {
        let down_for = Duration::from_millis(config.simulation.outage_ms);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!(?down_for, "severing link");
            control.sever();
            tokio::time::sleep(down_for).await;
            info!("restoring link");
            control.restore();
        })
    });

    let started = Instant::now();
    let limit = Duration::from_millis(config.simulation.converge_timeout_ms);
    let converged = tokio::time::timeout(
        limit,
        converge(&authority, &originator_store, &authority_store),
    )
    .await;

    if let Some(outage) = outage {
        outage.abort();
    }
    originator.shutdown().await?;
    authority.shutdown().await?;

    let records = match converged {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("Devices did not converge within {limit:?}"),
    };
    let summary = SimulationSummary {
        records,
        elapsed: started.elapsed(),
    };

    let roles = [Role::Originator, Role::Authority];
    let listed = list::collect(config, data_dir, &roles).await?;
    list::print_table(&listed, &roles);
    println!(
        "Converged: {} requests fulfilled and synced on both sides in {:.1}s",
        summary.records,
        summary.elapsed.as_secs_f64()
    );
    Ok(summary)
}

/// Fulfil everything the authority has seen and wait until both stores
/// agree that every record is fulfilled and synced. Returns the record
/// count.
async fn converge(
    authority: &SyncClient,
    originator_store: &SqliteStore,
    authority_store: &SqliteStore,
) -> Result<usize> {
    loop {
        for request in authority_store.all_with_state(RequestState::Submitted).await? {
            if let Err(e) = authority.mark_fulfilled(request.id()).await {
                warn!(id = %request.id(), error = %e, "could not fulfil request");
            }
        }

        let on_originator = originator_store.all().await?;
        let on_authority = authority_store.all().await?;
        let done = |r: &Request| r.state() == RequestState::Fulfilled && r.is_synced();
        if on_originator.len() == on_authority.len()
            && on_originator.iter().all(done)
            && on_authority.iter().all(done)
        {
            return Ok(on_originator.len());
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.engine.quiescence_window_ms = 50;
        config.engine.retry_delay_ms = 100;
        config.engine.subscribe_settle_delay_ms = 20;
        config.engine.full_state_delay_ms = 200;
        config.engine.reconnect_backoff_ms = 200;
        config.simulation.fragment_gap_ms = 1;
        config.simulation.outage_ms = 300;
        config.simulation.converge_timeout_ms = 30_000;
        config
    }

    #[tokio::test]
    async fn simulation_converges() {
        let dir = tempdir().unwrap();
        let config = fast_config();

        let summary = run(
            &config,
            dir.path(),
            SimulateOptions {
                requests: 3,
                drop_after: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.records, 3);
        let listed = list::collect(&config, dir.path(), &[Role::Originator, Role::Authority])
            .await
            .unwrap();
        assert_eq!(listed.len(), 6);
        assert!(listed.iter().all(|r| r.state == "fulfilled" && r.synced));
    }

    #[tokio::test]
    async fn simulation_survives_a_link_drop() {
        let dir = tempdir().unwrap();
        let config = fast_config();

        let summary = run(
            &config,
            dir.path(),
            SimulateOptions {
                requests: 2,
                drop_after: Some(Duration::from_millis(50)),
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.records, 2);
    }
}
