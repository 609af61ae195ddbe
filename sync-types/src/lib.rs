//! # sync-types
//!
//! Data model and wire codec for the poster-sync protocol.
//!
//! This crate provides the foundational types used across all poster-sync crates:
//! - [`RequestId`], [`Timestamp`], [`PeerId`] - Identity and time types
//! - [`Request`], [`RequestState`] - The synchronized record and its lifecycle
//! - [`Channel`], [`Payload`] - The three fixed channels and their payload shapes
//! - [`CodecError`] - Decode failures (always non-fatal)

#![warn(missing_docs)]
#![warn(clippy::all)]

mod codec;
mod error;
mod ids;
mod messages;
mod request;

pub use codec::MAX_PAYLOAD_SIZE;
pub use error::{CodecError, EncodeError, MalformedKind, TransitionError};
pub use ids::{PeerId, RequestId, Timestamp};
pub use messages::{
    Channel, FullStateMessage, Payload, RequestRecord, StatusMessage, SubmissionMessage,
};
pub use request::{Request, RequestState};
