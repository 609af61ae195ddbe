//! Error types for poster-sync.

use thiserror::Error;

use crate::{Channel, RequestState};

/// A payload could not be decoded for its channel.
///
/// Decode failures are never fatal: callers log the error and drop the
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The bytes do not form a valid payload of the channel's shape.
    #[error("malformed {channel} payload: {kind}")]
    MalformedPayload {
        /// Channel the payload arrived on.
        channel: Channel,
        /// What exactly was wrong.
        kind: MalformedKind,
    },
}

impl CodecError {
    /// The failure detail.
    pub fn kind(&self) -> &MalformedKind {
        match self {
            CodecError::MalformedPayload { kind, .. } => kind,
        }
    }
}

/// A payload could not be serialized.
#[derive(Debug, Error)]
#[error("failed to encode {channel} payload: {source}")]
pub struct EncodeError {
    /// Channel the payload was meant for.
    pub channel: Channel,
    /// Underlying MessagePack error.
    #[source]
    pub source: rmp_serde::encode::Error,
}

/// Reason a payload was rejected.
///
/// `UnknownField` and `MissingField` are refinements of a malformed payload,
/// not separate error classes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedKind {
    /// Not valid MessagePack, wrong structure, or trailing bytes.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A field the shape does not define.
    #[error("unknown field `{0}`")]
    UnknownField(String),

    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(String),

    /// Structurally valid but breaks a record invariant.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Larger than any single logical message may be.
    #[error("payload too large: {size} bytes (limit: {limit} bytes)")]
    Oversized {
        /// Actual size of the payload.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}

/// A request could not move to the requested state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Target state is not strictly later than the current one.
    #[error("cannot move from {from} to {to}")]
    NotAdvancing {
        /// Current state.
        from: RequestState,
        /// Requested state.
        to: RequestState,
    },

    /// `Fulfilled` without a fulfilment time.
    #[error("fulfilled request is missing fulfilledAt")]
    MissingFulfilledAt,

    /// A fulfilment time on a request that is not fulfilled.
    #[error("fulfilledAt present on {state} request")]
    UnexpectedFulfilledAt {
        /// The non-fulfilled state.
        state: RequestState,
    },
}
