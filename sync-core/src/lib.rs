//! # sync-core
//!
//! Pure logic for poster-sync (no I/O, instant tests).
//!
//! This crate implements the link state machine, merge rules, retry policy
//! and fragment accumulation without any radio, timer or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (transport, timers, storage) is performed by `sync-client`,
//! which interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod merge;
pub mod reassembly;
pub mod retry;
pub mod state;

pub use merge::{merge_snapshot_record, merge_status, merge_submission, DiscardReason, MergeOutcome};
pub use reassembly::{BufferError, FragmentBuffer};
pub use retry::{RetryDecision, RetryOutcome, RetryPolicy};
pub use state::{
    Action, ConnectionError, ConnectionMachine, ConnectionState, ConnectionStatus, Event,
    LinkPolicy, Role,
};
