//! Authority side: holds the queue, consumes submissions, pushes status.

use async_trait::async_trait;
use poster_sync_core::{merge_submission, MergeOutcome, Role};
use poster_sync_types::{Channel, Payload, Request, RequestId, RequestState};
use tracing::{debug, info, warn};

use super::{push_unsynced, relay_record, HandshakeReport, Orchestrator, RelayOutcome, SyncContext};
use crate::client::{ClientError, SyncEvent};
use crate::store::StoreError;

/// Orchestrator for the queue-holding device.
#[derive(Debug, Default)]
pub struct AuthorityOrchestrator;

impl AuthorityOrchestrator {
    /// Create a new authority orchestrator.
    pub fn new() -> Self {
        Self
    }
}

/// Status payload for records past `Submitted`; submissions are never
/// echoed back.
fn status_for(request: &Request) -> Option<Payload> {
    (request.state() != RequestState::Submitted).then(|| Payload::status(request))
}

#[async_trait]
impl Orchestrator for AuthorityOrchestrator {
    fn role(&self) -> Role {
        Role::Authority
    }

    fn inbound_channel(&self) -> Channel {
        Channel::Submission
    }

    async fn handshake(&self, ctx: &SyncContext) -> Result<HandshakeReport, ClientError> {
        if !ctx.retrier.link_up() {
            return Err(ClientError::NotReady);
        }
        let mut report = HandshakeReport::default();

        // Step 2: push every status change the originator has not seen.
        let mut pending = ctx.store.all_unsynced(RequestState::Acknowledged).await?;
        pending.extend(ctx.store.all_unsynced(RequestState::Fulfilled).await?);
        pending.sort_by_key(|r| (r.submitted_at(), r.id()));
        info!(count = pending.len(), "handshake: pushing status changes");
        push_unsynced(ctx, pending, Payload::status, &mut report).await?;

        Ok(report)
    }

    async fn relay(&self, ctx: &SyncContext, id: RequestId) -> Result<RelayOutcome, StoreError> {
        relay_record(ctx, id, status_for).await
    }

    async fn apply(
        &self,
        ctx: &SyncContext,
        payload: Payload,
    ) -> Result<Option<Request>, StoreError> {
        let Payload::Submission(submission) = payload else {
            warn!(channel = %payload.channel(), "authority ignores payload");
            return Ok(None);
        };

        let local = ctx.store.get(submission.id).await?;
        match merge_submission(local.as_ref(), &submission) {
            MergeOutcome::Insert(request) | MergeOutcome::Update(request) => {
                ctx.store.put(&request).await?;
                info!(id = %request.id(), label = %request.label(), "submission applied");
                ctx.notify(SyncEvent::RecordApplied(request.clone()));
                Ok(Some(request))
            }
            MergeOutcome::Discard(reason) => {
                debug!(id = %submission.id, ?reason, "submission discarded");
                Ok(None)
            }
        }
    }
}
