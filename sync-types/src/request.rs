//! The `Request` record and its lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::messages::RequestRecord;
use crate::{RequestId, Timestamp, TransitionError};

/// Lifecycle state of a request.
///
/// Totally ordered: `Submitted < Acknowledged < Fulfilled`. A record's state
/// only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Created by the originator.
    Submitted,
    /// Seen and accepted by the authority.
    Acknowledged,
    /// Pulled by the authority. Terminal.
    Fulfilled,
}

impl RequestState {
    /// All states, in lifecycle order.
    pub const ALL: [RequestState; 3] = [
        RequestState::Submitted,
        RequestState::Acknowledged,
        RequestState::Fulfilled,
    ];

    /// Stable lowercase name, used by storage backends and the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Submitted => "submitted",
            RequestState::Acknowledged => "acknowledged",
            RequestState::Fulfilled => "fulfilled",
        }
    }

    /// Parse the lowercase name produced by [`as_str`](Self::as_str).
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "submitted" => Some(RequestState::Submitted),
            "acknowledged" => Some(RequestState::Acknowledged),
            "fulfilled" => Some(RequestState::Fulfilled),
            _ => None,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A poster-pull request: the unit of work flowing through the system.
///
/// Fields are private so that `fulfilled_at` stays present exactly when the
/// state is `Fulfilled`, and so that every local mutation clears `synced`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    id: RequestId,
    label: String,
    state: RequestState,
    submitted_at: Timestamp,
    fulfilled_at: Option<Timestamp>,
    synced: bool,
}

impl Request {
    /// Create a new request on the originator side.
    ///
    /// The record starts `Submitted` and unsynced.
    pub fn submit(label: impl Into<String>, now: Timestamp) -> Self {
        Self::with_id(RequestId::new(), label, now)
    }

    /// Create a new `Submitted`, unsynced request with a caller-chosen id.
    pub fn with_id(id: RequestId, label: impl Into<String>, submitted_at: Timestamp) -> Self {
        Self {
            id,
            label: label.into(),
            state: RequestState::Submitted,
            submitted_at,
            fulfilled_at: None,
            synced: false,
        }
    }

    /// Rebuild a request from its wire record plus the local `synced` flag.
    ///
    /// Fails if the record breaks the `fulfilled_at` invariant.
    pub fn from_record(record: RequestRecord, synced: bool) -> Result<Self, TransitionError> {
        check_fulfilled_at(record.state, record.fulfilled_at)?;
        Ok(Self {
            id: record.id,
            label: record.label,
            state: record.state,
            submitted_at: record.submitted_at,
            fulfilled_at: record.fulfilled_at,
            synced,
        })
    }

    /// The five transmitted fields of this request.
    pub fn to_record(&self) -> RequestRecord {
        RequestRecord {
            id: self.id,
            label: self.label.clone(),
            state: self.state,
            submitted_at: self.submitted_at,
            fulfilled_at: self.fulfilled_at,
        }
    }

    /// The request id.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The human-supplied label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// When the originator created the request.
    pub fn submitted_at(&self) -> Timestamp {
        self.submitted_at
    }

    /// When the authority fulfilled the request, if it has.
    pub fn fulfilled_at(&self) -> Option<Timestamp> {
        self.fulfilled_at
    }

    /// Whether the last local mutation has been acknowledged by the peer.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Record a positive transport acknowledgement.
    pub fn mark_synced(&mut self) {
        self.synced = true;
    }

    /// Builder form of [`mark_synced`](Self::mark_synced).
    pub fn synced(mut self) -> Self {
        self.synced = true;
        self
    }

    /// Authority-side `Submitted -> Acknowledged`. Clears `synced`.
    pub fn acknowledge(&mut self) -> Result<(), TransitionError> {
        self.advance(RequestState::Acknowledged, None)?;
        self.synced = false;
        Ok(())
    }

    /// Authority-side transition to `Fulfilled`. Clears `synced`.
    pub fn fulfill(&mut self, now: Timestamp) -> Result<(), TransitionError> {
        self.advance(RequestState::Fulfilled, Some(now))?;
        self.synced = false;
        Ok(())
    }

    /// Move to a strictly later state without touching `synced`.
    ///
    /// Used when applying a peer's status; local mutations go through
    /// [`acknowledge`](Self::acknowledge) and [`fulfill`](Self::fulfill).
    pub fn advance(
        &mut self,
        state: RequestState,
        fulfilled_at: Option<Timestamp>,
    ) -> Result<(), TransitionError> {
        if state <= self.state {
            return Err(TransitionError::NotAdvancing {
                from: self.state,
                to: state,
            });
        }
        check_fulfilled_at(state, fulfilled_at)?;
        self.state = state;
        self.fulfilled_at = fulfilled_at;
        Ok(())
    }
}

/// `fulfilled_at` is set if and only if the state is `Fulfilled`.
pub(crate) fn check_fulfilled_at(
    state: RequestState,
    fulfilled_at: Option<Timestamp>,
) -> Result<(), TransitionError> {
    match (state, fulfilled_at) {
        (RequestState::Fulfilled, Some(_)) => Ok(()),
        (RequestState::Fulfilled, None) => Err(TransitionError::MissingFulfilledAt),
        (_, Some(_)) => Err(TransitionError::UnexpectedFulfilledAt { state }),
        (_, None) => Ok(()),
    }
}
