//! # sync-client
//!
//! Async sync engine for the poster-sync request protocol.
//!
//! This is the library that applications embed on both devices: the
//! originator that creates requests and the authority that holds the queue
//! and fulfils them.
//!
//! ## Features
//!
//! - **Offline-first**: every change is stored before it is sent; anything
//!   the peer has not acknowledged goes out on the next reconnection
//! - **Transport Abstraction**: Pluggable link layer (loopback, mock)
//! - **Fragment Reassembly**: per-stream quiescence window, no framing
//! - **Pure State Machine**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use poster_sync_client::{LoopbackTransport, MemoryStore, SyncClient, SyncConfig};
//!
//! let (originator_link, authority_link) = LoopbackTransport::pair();
//! let originator = SyncClient::start(
//!     SyncConfig::originator(),
//!     Arc::new(originator_link),
//!     Arc::new(MemoryStore::new()),
//! )?;
//! let authority = SyncClient::start(
//!     SyncConfig::authority(),
//!     Arc::new(authority_link),
//!     Arc::new(MemoryStore::new()),
//! )?;
//!
//! let request = originator.submit("A42").await?;
//! authority.mark_fulfilled(request.id()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod orchestrator;
pub mod pacing;
pub mod reassembly;
pub mod retry;
mod session;
pub mod store;
pub mod transport;

pub use client::{ClientError, SyncClient, SyncEvent};
pub use config::SyncConfig;
pub use orchestrator::{HandshakeReport, RelayOutcome};
pub use store::{MemoryStore, RecordStore, StoreError};
pub use transport::{
    LinkEvent, LoopbackConfig, LoopbackTransport, MockTransport, Transport, TransportError,
};

pub use poster_sync_core::{ConnectionStatus, Role};
pub use poster_sync_types::{Request, RequestId, RequestState, Timestamp};
