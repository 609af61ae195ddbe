//! Merge rules for inbound records.
//!
//! Deduplication is keyed on the request id alone, and a record's state
//! never moves backwards. Applying the same inbound message twice therefore
//! yields the same store contents as applying it once.

use poster_sync_types::{
    Request, RequestRecord, RequestState, StatusMessage, SubmissionMessage, TransitionError,
};

/// What to do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Store this new record.
    Insert(Request),
    /// Replace the local record with this one.
    Update(Request),
    /// Leave the store untouched.
    Discard(DiscardReason),
}

impl MergeOutcome {
    /// The record to write, if any.
    pub fn into_record(self) -> Option<Request> {
        match self {
            MergeOutcome::Insert(request) | MergeOutcome::Update(request) => Some(request),
            MergeOutcome::Discard(_) => None,
        }
    }
}

/// Why an inbound message was ignored. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Local copy is already at the incoming state.
    Duplicate,
    /// Local copy is at a later state than the incoming one.
    Stale {
        /// Local state.
        local: RequestState,
        /// Incoming state.
        incoming: RequestState,
    },
    /// A status for a request this side has never seen.
    UnknownRequest,
    /// The incoming change could not be applied to the local record.
    Rejected(TransitionError),
}

/// Merge a submission arriving at the authority.
///
/// A submission only ever carries `Submitted`, so any existing local copy is
/// equal-or-later and wins.
pub fn merge_submission(local: Option<&Request>, incoming: &SubmissionMessage) -> MergeOutcome {
    match local {
        Some(existing) if existing.state() == RequestState::Submitted => {
            MergeOutcome::Discard(DiscardReason::Duplicate)
        }
        Some(existing) => MergeOutcome::Discard(DiscardReason::Stale {
            local: existing.state(),
            incoming: RequestState::Submitted,
        }),
        // Received copies have nothing left to transmit.
        None => MergeOutcome::Insert(
            Request::with_id(incoming.id, incoming.label.clone(), incoming.submitted_at).synced(),
        ),
    }
}

/// Merge a status change arriving at the originator.
///
/// Advancing a record because the peer already holds it at a later state
/// also marks it synced: there is nothing left to tell the peer.
pub fn merge_status(local: Option<&Request>, incoming: &StatusMessage) -> MergeOutcome {
    let Some(existing) = local else {
        return MergeOutcome::Discard(DiscardReason::UnknownRequest);
    };

    if incoming.state == existing.state() {
        return MergeOutcome::Discard(DiscardReason::Duplicate);
    }
    if incoming.state < existing.state() {
        return MergeOutcome::Discard(DiscardReason::Stale {
            local: existing.state(),
            incoming: incoming.state,
        });
    }

    let mut updated = existing.clone();
    match updated.advance(incoming.state, incoming.fulfilled_at) {
        Ok(()) => MergeOutcome::Update(updated.synced()),
        Err(e) => MergeOutcome::Discard(DiscardReason::Rejected(e)),
    }
}

/// Convert a full-state snapshot record into the record to store.
///
/// The snapshot is authoritative: the local copy is overwritten wholesale
/// regardless of its state, and stored synced.
pub fn merge_snapshot_record(record: RequestRecord) -> Result<Request, TransitionError> {
    Request::from_record(record, true)
}
