//! SyncClient - the main interface for poster-sync.
//!
//! This module provides [`SyncClient`], the handle applications use to
//! create and progress requests while the engine keeps both devices in
//! agreement over the link.
//!
//! # Architecture
//!
//! SyncClient is a cheap handle onto one session task. The session owns the
//! pure connection state machine (from sync-core) and the role's
//! orchestrator, and interprets the machine's actions to perform the actual
//! I/O via the Transport trait.
//!
//! ```text
//! Application → SyncClient ─mpsc─► session task → Transport → Radio
//!                    ▲                  │
//!                    └──── broadcast ◄──┘   sync-core (pure state machine)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use poster_sync_client::{LoopbackTransport, MemoryStore, SyncClient, SyncConfig};
//!
//! let (link, _peer) = LoopbackTransport::pair();
//! let client = SyncClient::start(
//!     SyncConfig::originator(),
//!     Arc::new(link),
//!     Arc::new(MemoryStore::new()),
//! )?;
//!
//! let request = client.submit("A42").await?;
//! let mut events = client.subscribe();
//! ```

use poster_sync_core::{ConnectionStatus, Role};
use poster_sync_types::{Request, RequestId, TransitionError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::SyncConfig;
use crate::orchestrator::HandshakeReport;
use crate::session::{self, Command, Reply, SessionMsg};
use crate::store::{RecordStore, StoreError};
use crate::transport::{Transport, TransportError};

/// Capacity of the notification channel. Slow subscribers lag rather than
/// stall the engine.
const EVENT_CAPACITY: usize = 256;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The requested state change is not allowed.
    #[error("invalid transition: {0}")]
    Transition(#[from] TransitionError),

    /// No record with this id.
    #[error("no request with id {0}")]
    NotFound(RequestId),

    /// The operation belongs to the other role.
    #[error("{operation} is not available to the {role}")]
    WrongRole {
        /// The rejected operation.
        operation: &'static str,
        /// This engine's role.
        role: Role,
    },

    /// The link is not ready.
    #[error("link not ready")]
    NotReady,

    /// The transport's event stream was already taken.
    #[error("transport event stream already taken")]
    EventsUnavailable,

    /// The engine has shut down.
    #[error("sync engine has shut down")]
    Shutdown,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The link status changed.
    StatusChanged(ConnectionStatus),
    /// A peer's update was applied to the local store.
    RecordApplied(Request),
    /// Number of records not yet acknowledged by the peer.
    UnsyncedCount(usize),
    /// A connection problem worth showing to the user.
    ConnectionError(String),
    /// A reconnection handshake finished.
    HandshakeFinished(HandshakeReport),
}

/// The main sync client.
///
/// Clones share the same engine.
#[derive(Clone)]
pub struct SyncClient {
    role: Role,
    mailbox: mpsc::UnboundedSender<SessionMsg>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<SyncEvent>,
    store: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("role", &self.role)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl SyncClient {
    /// Start the engine and begin connecting.
    ///
    /// Must be called from within a tokio runtime. Fails if the transport's
    /// event stream was already taken by another engine.
    pub fn start(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, ClientError> {
        let link_events = transport.take_events().ok_or(ClientError::EventsUnavailable)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handles = session::spawn(
            config.clone(),
            transport,
            Arc::clone(&store),
            link_events,
            events.clone(),
        );

        Ok(Self {
            role: config.role,
            mailbox: handles.mailbox,
            status: handles.status,
            events,
            store,
        })
    }

    /// This engine's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current link status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch the link status.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Subscribe to presentation notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Create a request (originator only).
    ///
    /// The record is stored unsynced before this returns; transmission
    /// follows if the link is ready.
    pub async fn submit(&self, label: impl Into<String>) -> Result<Request, ClientError> {
        self.require(Role::Originator, "submit")?;
        let label = label.into();
        self.command(|reply| Command::Submit { label, reply }).await
    }

    /// Acknowledge a submitted request (authority only).
    pub async fn acknowledge(&self, id: RequestId) -> Result<Request, ClientError> {
        self.require(Role::Authority, "acknowledge")?;
        self.command(|reply| Command::Acknowledge { id, reply }).await
    }

    /// Mark a request fulfilled (authority only).
    pub async fn mark_fulfilled(&self, id: RequestId) -> Result<Request, ClientError> {
        self.require(Role::Authority, "mark_fulfilled")?;
        self.command(|reply| Command::Fulfill { id, reply }).await
    }

    /// All local records, oldest first.
    pub async fn records(&self) -> Result<Vec<Request>, ClientError> {
        Ok(self.store.all().await?)
    }

    /// Number of records the peer has not acknowledged yet.
    pub async fn unsynced_count(&self) -> Result<usize, ClientError> {
        Ok(self.store.unsynced_count().await?)
    }

    /// Stop the engine and disconnect. Further commands fail with
    /// [`ClientError::Shutdown`].
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (reply, done) = oneshot::channel();
        self.mailbox
            .send(SessionMsg::Shutdown { reply })
            .map_err(|_| ClientError::Shutdown)?;
        done.await.map_err(|_| ClientError::Shutdown)
    }

    fn require(&self, role: Role, operation: &'static str) -> Result<(), ClientError> {
        if self.role == role {
            Ok(())
        } else {
            Err(ClientError::WrongRole {
                operation,
                role: self.role,
            })
        }
    }

    async fn command<F>(&self, make: F) -> Result<Request, ClientError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(SessionMsg::Command(make(reply)))
            .map_err(|_| ClientError::Shutdown)?;
        response.await.map_err(|_| ClientError::Shutdown)?
    }
}
