//! Channel payloads for poster-sync.
//!
//! The link carries exactly three fixed channels, each with a single payload
//! shape. There is no type tag on the wire: the channel a payload travels on
//! determines how it is decoded.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Request, RequestId, RequestState, Timestamp};

/// One of the three fixed data channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// New requests, originator -> authority. Written by the originator.
    Submission,
    /// State changes, authority -> originator. Subscribed by the originator.
    Status,
    /// Read-only snapshot of the authority's queue. Read by the originator.
    FullState,
}

impl Channel {
    /// All channels.
    pub const ALL: [Channel; 3] = [Channel::Submission, Channel::Status, Channel::FullState];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Submission => "submission",
            Channel::Status => "status",
            Channel::FullState => "full-state",
        })
    }
}

/// A new request announced by the originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubmissionMessage {
    /// Request id (dedup key).
    pub id: RequestId,
    /// Human-supplied label.
    pub label: String,
    /// Creation time on the originator.
    pub submitted_at: Timestamp,
}

/// A state change published by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusMessage {
    /// Request id (dedup key).
    pub id: RequestId,
    /// New state.
    pub state: RequestState,
    /// Present iff `state` is `Fulfilled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<Timestamp>,
}

/// The five transmitted fields of a [`Request`]. `synced` never leaves the
/// device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestRecord {
    /// Request id.
    pub id: RequestId,
    /// Human-supplied label.
    pub label: String,
    /// Lifecycle state.
    pub state: RequestState,
    /// Creation time on the originator.
    pub submitted_at: Timestamp,
    /// Present iff `state` is `Fulfilled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<Timestamp>,
}

/// Ordered snapshot of every request the authority holds.
///
/// Encoded as a bare array of records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FullStateMessage {
    /// Records, in the authority's order.
    pub requests: Vec<RequestRecord>,
}

/// A decoded payload, tagged by the channel it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// See [`SubmissionMessage`].
    Submission(SubmissionMessage),
    /// See [`StatusMessage`].
    Status(StatusMessage),
    /// See [`FullStateMessage`].
    FullState(FullStateMessage),
}

impl Payload {
    /// Submission payload for a locally created request.
    pub fn submission(request: &Request) -> Self {
        Payload::Submission(SubmissionMessage {
            id: request.id(),
            label: request.label().to_string(),
            submitted_at: request.submitted_at(),
        })
    }

    /// Status payload reflecting a request's current state.
    pub fn status(request: &Request) -> Self {
        Payload::Status(StatusMessage {
            id: request.id(),
            state: request.state(),
            fulfilled_at: request.fulfilled_at(),
        })
    }

    /// Full-state payload for a set of requests, in the given order.
    pub fn full_state<'a>(requests: impl IntoIterator<Item = &'a Request>) -> Self {
        Payload::FullState(FullStateMessage {
            requests: requests.into_iter().map(Request::to_record).collect(),
        })
    }

    /// The channel this payload travels on.
    pub fn channel(&self) -> Channel {
        match self {
            Payload::Submission(_) => Channel::Submission,
            Payload::Status(_) => Channel::Status,
            Payload::FullState(_) => Channel::FullState,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_channels() {
        let request = Request::submit("A42", Timestamp::from_millis(1));
        assert_eq!(Payload::submission(&request).channel(), Channel::Submission);
        assert_eq!(Payload::status(&request).channel(), Channel::Status);
        assert_eq!(
            Payload::full_state([&request]).channel(),
            Channel::FullState
        );
    }

    #[test]
    fn status_payload_carries_fulfilment() {
        let mut request = Request::submit("A42", Timestamp::from_millis(1));
        request.fulfill(Timestamp::from_millis(9)).unwrap();

        match Payload::status(&request) {
            Payload::Status(status) => {
                assert_eq!(status.state, RequestState::Fulfilled);
                assert_eq!(status.fulfilled_at, Some(Timestamp::from_millis(9)));
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn full_state_preserves_order() {
        let a = Request::submit("A", Timestamp::from_millis(1));
        let b = Request::submit("B", Timestamp::from_millis(2));
        match Payload::full_state([&b, &a]) {
            Payload::FullState(snapshot) => {
                let labels: Vec<_> = snapshot.requests.iter().map(|r| r.label.as_str()).collect();
                assert_eq!(labels, vec!["B", "A"]);
            }
            other => panic!("Expected FullState, got {:?}", other),
        }
    }

    #[test]
    fn channel_display() {
        assert_eq!(Channel::FullState.to_string(), "full-state");
    }
}
