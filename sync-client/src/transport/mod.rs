//! Transport abstraction for poster-sync.
//!
//! This module provides a pluggable transport layer that abstracts the
//! short-range radio link (BLE on devices, loopback and mock for testing).
//!
//! # Design
//!
//! The transport trait is async and link-oriented:
//! - `establish()` scans and connects (originator) or advertises and accepts
//!   (authority)
//! - `negotiate_unit_size()` agrees on the largest single write
//! - `subscribe()` starts delivery of inbound fragments for a channel
//! - `write()` sends one logical message, fragmenting it as needed
//! - `read()` performs a request/response read
//! - `disconnect()` tears the link down
//!
//! Everything the peer initiates arrives on one event stream
//! ([`LinkEvent`]) taken once with [`Transport::take_events`].
//!
//! # Example
//!
//! ```ignore
//! let (originator, authority) = LoopbackTransport::pair();
//! let peer = originator.establish(Role::Originator).await?;
//! originator.write(Channel::Submission, &bytes).await?;
//! ```

mod loopback;
mod mock;

pub use loopback::{LoopbackConfig, LoopbackTransport};
pub use mock::MockTransport;

use async_trait::async_trait;
use poster_sync_core::Role;
use poster_sync_types::{Channel, PeerId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Scanning, advertising or connecting failed.
    #[error("establish failed: {0}")]
    EstablishFailed(String),

    /// Capability negotiation failed.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Subscribing to a channel failed.
    #[error("subscribe to {channel} failed: {reason}")]
    SubscribeFailed {
        /// Channel that could not be subscribed.
        channel: Channel,
        /// Why.
        reason: String,
    },

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// The link dropped while the operation was in progress.
    #[error("link lost: {0}")]
    LinkLost(String),

    /// The peer did not acknowledge a write.
    #[error("write on {channel} failed: {reason}")]
    WriteFailed {
        /// Channel written to.
        channel: Channel,
        /// Why.
        reason: String,
    },

    /// A read did not produce a response.
    #[error("read on {channel} failed: {reason}")]
    ReadFailed {
        /// Channel read from.
        channel: Channel,
        /// Why.
        reason: String,
    },
}

impl TransportError {
    /// Whether this error means the link itself is gone, as opposed to a
    /// single operation failing on a live link.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, TransportError::NotConnected | TransportError::LinkLost(_))
    }
}

/// Something the peer or the link did.
#[derive(Debug)]
pub enum LinkEvent {
    /// One transport unit written by the peer on a subscribed channel.
    Fragment {
        /// Writing peer.
        peer: PeerId,
        /// Channel written to.
        channel: Channel,
        /// Fragment bytes.
        bytes: Vec<u8>,
    },
    /// The peer wants to read `channel`. Answer through `reply`; dropping
    /// it fails the peer's read.
    ReadRequest {
        /// Channel being read.
        channel: Channel,
        /// Where to send the response bytes.
        reply: oneshot::Sender<Vec<u8>>,
    },
    /// The link dropped or a subscription on it was cancelled.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
}

/// Transport trait for the point-to-point link.
///
/// Implementations handle the underlying radio (BLE, loopback, mock).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Find and connect to a peer. Originators scan; authorities advertise
    /// and wait for a connection.
    async fn establish(&self, role: Role) -> Result<PeerId, TransportError>;

    /// Negotiate the largest single-write size, starting from `requested`.
    ///
    /// Returns the usable size, which may be smaller.
    async fn negotiate_unit_size(&self, requested: usize) -> Result<usize, TransportError>;

    /// Start receiving the peer's writes on `channel`.
    async fn subscribe(&self, channel: Channel) -> Result<(), TransportError>;

    /// Write one logical message on `channel`.
    ///
    /// Returns once the peer acknowledged every fragment.
    async fn write(&self, channel: Channel, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read `channel` from the peer.
    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError>;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Take the inbound event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;
}
