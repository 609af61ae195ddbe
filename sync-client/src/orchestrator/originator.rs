//! Originator side: creates requests, consumes status and full state.

use async_trait::async_trait;
use poster_sync_core::{
    merge_snapshot_record, merge_status, DiscardReason, MergeOutcome, RetryOutcome, Role,
};
use poster_sync_types::{Channel, Payload, Request, RequestId, RequestState};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::{push_unsynced, relay_record, HandshakeReport, Orchestrator, RelayOutcome, SyncContext};
use crate::client::{ClientError, SyncEvent};
use crate::store::StoreError;

/// Orchestrator for the request-creating device.
#[derive(Debug, Default)]
pub struct OriginatorOrchestrator;

impl OriginatorOrchestrator {
    /// Create a new originator orchestrator.
    pub fn new() -> Self {
        Self
    }

    /// Handshake step 3: read the authority's full state and let it win.
    async fn reconcile(
        &self,
        ctx: &SyncContext,
        report: &mut HandshakeReport,
    ) -> Result<(), StoreError> {
        let bytes = match ctx
            .retrier
            .run(|| ctx.transport.read(Channel::FullState))
            .await
        {
            RetryOutcome::Delivered { value, .. } => value,
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                warn!(attempts, error = %last_error, "full-state read failed");
                return Ok(());
            }
            RetryOutcome::LinkLost { .. } => {
                report.interrupted = true;
                return Ok(());
            }
        };

        let snapshot = match Payload::from_bytes(Channel::FullState, &bytes) {
            Ok(Payload::FullState(snapshot)) => snapshot,
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "discarding full-state snapshot");
                return Ok(());
            }
        };

        let total = snapshot.requests.len();
        for record in snapshot.requests {
            let id = record.id;
            let incoming = match merge_snapshot_record(record) {
                Ok(request) => request,
                Err(e) => {
                    warn!(%id, error = %e, "skipping invalid snapshot record");
                    continue;
                }
            };
            if ctx.store.get(id).await?.as_ref() == Some(&incoming) {
                continue;
            }
            ctx.store.put(&incoming).await?;
            ctx.notify(SyncEvent::RecordApplied(incoming));
            report.reconciled += 1;
        }
        debug!(total, changed = report.reconciled, "full state reconciled");
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for OriginatorOrchestrator {
    fn role(&self) -> Role {
        Role::Originator
    }

    fn inbound_channel(&self) -> Channel {
        Channel::Status
    }

    async fn handshake(&self, ctx: &SyncContext) -> Result<HandshakeReport, ClientError> {
        if !ctx.retrier.link_up() {
            return Err(ClientError::NotReady);
        }
        let started = Instant::now();
        let mut report = HandshakeReport::default();

        // Step 1: push our unsynced submissions.
        let pending = ctx.store.all_unsynced(RequestState::Submitted).await?;
        info!(count = pending.len(), "handshake: pushing submissions");
        push_unsynced(ctx, pending, Payload::submission, &mut report).await?;
        if report.interrupted {
            return Ok(report);
        }

        // Step 3: the authority pushes its statuses meanwhile; give it time.
        tokio::select! {
            biased;
            _ = ctx.retrier.link_lost() => {
                report.interrupted = true;
                return Ok(report);
            }
            _ = sleep_until(started + ctx.full_state_delay) => {}
        }
        self.reconcile(ctx, &mut report).await?;

        Ok(report)
    }

    async fn relay(&self, ctx: &SyncContext, id: RequestId) -> Result<RelayOutcome, StoreError> {
        relay_record(ctx, id, |request| {
            (request.state() == RequestState::Submitted).then(|| Payload::submission(request))
        })
        .await
    }

    async fn apply(
        &self,
        ctx: &SyncContext,
        payload: Payload,
    ) -> Result<Option<Request>, StoreError> {
        let Payload::Status(status) = payload else {
            warn!(channel = %payload.channel(), "originator ignores payload");
            return Ok(None);
        };

        let local = ctx.store.get(status.id).await?;
        match merge_status(local.as_ref(), &status) {
            MergeOutcome::Insert(request) | MergeOutcome::Update(request) => {
                ctx.store.put(&request).await?;
                info!(id = %request.id(), state = %request.state(), "status applied");
                ctx.notify(SyncEvent::RecordApplied(request.clone()));
                Ok(Some(request))
            }
            MergeOutcome::Discard(DiscardReason::UnknownRequest) => {
                debug!(id = %status.id, "status for unknown request, waiting for full state");
                Ok(None)
            }
            MergeOutcome::Discard(reason) => {
                debug!(id = %status.id, ?reason, "status discarded");
                Ok(None)
            }
        }
    }
}
