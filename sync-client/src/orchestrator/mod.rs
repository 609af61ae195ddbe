//! Sync orchestration.
//!
//! The orchestrator decides what to transmit and when, and how inbound
//! payloads are applied. The role is fixed at startup, so each role gets its
//! own implementation of [`Orchestrator`] instead of branching on the role
//! throughout.
//!
//! ```text
//!   Ready entry ──► handshake()          (once per Ready entry)
//!   local change ─► relay(id)            (steady state)
//!   inbound msg ──► apply(payload)       (dedup + no regression)
//! ```
//!
//! Every method runs on the session task, one at a time, so the store never
//! sees two orchestrator writes race each other.

mod authority;
mod originator;

pub use authority::AuthorityOrchestrator;
pub use originator::OriginatorOrchestrator;

use async_trait::async_trait;
use poster_sync_core::{RetryOutcome, Role};
use poster_sync_types::{Channel, Payload, Request, RequestId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, SyncEvent};
use crate::pacing::WritePacer;
use crate::retry::Retrier;
use crate::store::{RecordStore, StoreError};
use crate::transport::{Transport, TransportError};

/// Everything an orchestrator needs to do its work.
#[derive(Clone)]
pub struct SyncContext {
    /// The link.
    pub transport: Arc<dyn Transport>,
    /// Durable records.
    pub store: Arc<dyn RecordStore>,
    /// Retry policy bound to the link watch.
    pub retrier: Retrier,
    /// Keeps consecutive writes on a channel apart.
    pub pacer: WritePacer,
    /// Delay from handshake start before reading full state.
    pub full_state_delay: Duration,
    /// Presentation notifications.
    pub events: broadcast::Sender<SyncEvent>,
}

impl SyncContext {
    /// Send a notification. Having no subscribers is fine.
    pub fn notify(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

/// Summary of one reconnection handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeReport {
    /// Records delivered and marked synced.
    pub sent: usize,
    /// Records whose retries were exhausted; still unsynced.
    pub failed: usize,
    /// Records overwritten from the full-state snapshot.
    pub reconciled: usize,
    /// The link dropped before the handshake finished.
    pub interrupted: bool,
}

/// Result of relaying one record outside the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Peer acknowledged; record marked synced.
    Delivered,
    /// Nothing to send for this record.
    NothingToSend,
    /// The link is not `Ready`; the next handshake will pick it up.
    NotReady,
    /// Every attempt failed; record left unsynced.
    Exhausted(TransportError),
    /// The link dropped mid-transmission; record left unsynced.
    LinkLost,
}

impl RelayOutcome {
    /// Whether this outcome means the link should be treated as lost.
    pub fn link_failed(&self) -> bool {
        matches!(self, RelayOutcome::Exhausted(_) | RelayOutcome::LinkLost)
    }
}

/// Role-specific sync behavior.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// The role this orchestrator implements.
    fn role(&self) -> Role;

    /// Channel the peer writes to us on.
    fn inbound_channel(&self) -> Channel;

    /// Reconnection handshake. Fails only if the link is not `Ready` at its
    /// start; per-record failures are counted in the report.
    async fn handshake(&self, ctx: &SyncContext) -> Result<HandshakeReport, ClientError>;

    /// Transmit one locally changed record.
    async fn relay(&self, ctx: &SyncContext, id: RequestId) -> Result<RelayOutcome, StoreError>;

    /// Apply an inbound payload. Returns the stored record if anything
    /// changed.
    async fn apply(&self, ctx: &SyncContext, payload: Payload)
        -> Result<Option<Request>, StoreError>;
}

/// Create the orchestrator for `role`.
pub fn for_role(role: Role) -> Box<dyn Orchestrator> {
    match role {
        Role::Originator => Box::new(OriginatorOrchestrator::new()),
        Role::Authority => Box::new(AuthorityOrchestrator::new()),
    }
}

/// Transmit `payload` for `request` through the retry policy and mark the
/// record synced once the peer acknowledged it.
pub(crate) async fn deliver(
    ctx: &SyncContext,
    request: &Request,
    payload: Payload,
) -> Result<RetryOutcome<(), TransportError>, StoreError> {
    let channel = payload.channel();
    let bytes = match payload.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(id = %request.id(), error = %e, "record could not be encoded");
            return Ok(RetryOutcome::Exhausted {
                attempts: 0,
                last_error: TransportError::WriteFailed {
                    channel,
                    reason: e.to_string(),
                },
            });
        }
    };
    let bytes = bytes.as_slice();
    let outcome = ctx
        .retrier
        .run(move || async move {
            ctx.pacer.ready(channel).await;
            let result = ctx.transport.write(channel, bytes).await;
            ctx.pacer.wrote(channel).await;
            result
        })
        .await;

    if outcome.is_delivered() {
        let mut synced = request.clone();
        synced.mark_synced();
        ctx.store.put(&synced).await?;
        debug!(id = %request.id(), %channel, attempts = outcome.attempts(), "record delivered");
    }
    Ok(outcome)
}

/// Handshake push step: deliver `records` one at a time.
///
/// A record that exhausts its retries is skipped; a lost link stops the
/// loop.
pub(crate) async fn push_unsynced(
    ctx: &SyncContext,
    records: Vec<Request>,
    encode: fn(&Request) -> Payload,
    report: &mut HandshakeReport,
) -> Result<(), StoreError> {
    for request in records {
        match deliver(ctx, &request, encode(&request)).await? {
            RetryOutcome::Delivered { .. } => report.sent += 1,
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                warn!(
                    id = %request.id(),
                    attempts,
                    error = %last_error,
                    "retries exhausted, record left unsynced"
                );
                report.failed += 1;
            }
            RetryOutcome::LinkLost { attempts } => {
                info!(id = %request.id(), attempts, "link lost during handshake");
                report.interrupted = true;
                break;
            }
        }
    }
    Ok(())
}

/// Steady-state relay of one record, shared by both roles.
pub(crate) async fn relay_record(
    ctx: &SyncContext,
    id: RequestId,
    encode: fn(&Request) -> Option<Payload>,
) -> Result<RelayOutcome, StoreError> {
    let Some(request) = ctx.store.get(id).await? else {
        warn!(%id, "relay requested for unknown record");
        return Ok(RelayOutcome::NothingToSend);
    };
    if request.is_synced() {
        return Ok(RelayOutcome::NothingToSend);
    }
    let Some(payload) = encode(&request) else {
        return Ok(RelayOutcome::NothingToSend);
    };
    if !ctx.retrier.link_up() {
        debug!(%id, "link not ready, leaving record for the next handshake");
        return Ok(RelayOutcome::NotReady);
    }

    Ok(match deliver(ctx, &request, payload).await? {
        RetryOutcome::Delivered { .. } => RelayOutcome::Delivered,
        RetryOutcome::Exhausted {
            attempts,
            last_error,
        } => {
            warn!(%id, attempts, error = %last_error, "relay failed, record left unsynced");
            RelayOutcome::Exhausted(last_error)
        }
        RetryOutcome::LinkLost { attempts } => {
            info!(%id, attempts, "link lost during relay, record left unsynced");
            RelayOutcome::LinkLost
        }
    })
}
