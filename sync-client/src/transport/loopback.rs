//! In-process loopback link.
//!
//! Two [`LoopbackTransport`] endpoints share one simulated radio link.
//! Writes are cut into negotiated-size fragments and delivered to the other
//! endpoint's event stream with an optional gap between fragments, which is
//! enough to exercise reassembly, retry and link-loss handling without
//! hardware. The link can be severed and restored from outside.

use super::{LinkEvent, Transport, TransportError};
use async_trait::async_trait;
use poster_sync_core::Role;
use poster_sync_types::{Channel, PeerId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// How long a read waits for the peer to answer.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Link characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Largest unit size the link supports.
    pub max_unit_size: usize,
    /// Pause between consecutive fragments of one write.
    pub fragment_gap: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_unit_size: 185,
            fragment_gap: Duration::from_millis(5),
        }
    }
}

/// One end of a simulated point-to-point link.
#[derive(Clone)]
pub struct LoopbackTransport {
    side: usize,
    link: Arc<Link>,
}

struct Link {
    config: LoopbackConfig,
    state: Mutex<LinkState>,
    /// Bumped on every state change so `establish` can wait on it.
    generation: watch::Sender<u64>,
}

struct LinkState {
    available: bool,
    ends: [End; 2],
}

struct End {
    id: PeerId,
    linking: bool,
    connected: bool,
    unit_size: usize,
    subscriptions: HashSet<Channel>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl End {
    fn new(id: &str, unit_size: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: PeerId::new(id),
            linking: false,
            connected: false,
            unit_size,
            subscriptions: HashSet::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    fn drop_link(&mut self, reason: &str) {
        if self.connected {
            let _ = self.events_tx.send(LinkEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        self.connected = false;
        self.subscriptions.clear();
    }
}

impl LoopbackTransport {
    /// Create two connected endpoints with the default link.
    pub fn pair() -> (Self, Self) {
        Self::pair_with(LoopbackConfig::default())
    }

    /// Create two connected endpoints.
    pub fn pair_with(config: LoopbackConfig) -> (Self, Self) {
        let unit_size = config.max_unit_size;
        let (generation, _) = watch::channel(0);
        let link = Arc::new(Link {
            config,
            state: Mutex::new(LinkState {
                available: true,
                ends: [End::new("loopback-a", unit_size), End::new("loopback-b", unit_size)],
            }),
            generation,
        });
        (
            Self {
                side: 0,
                link: Arc::clone(&link),
            },
            Self { side: 1, link },
        )
    }

    /// Peer id the other endpoint sees for this one.
    pub fn local_id(&self) -> PeerId {
        let state = self.lock();
        state.ends[self.side].id.clone()
    }

    /// Take the link down. Both endpoints see `Disconnected`, and
    /// `establish` blocks until [`restore`](Self::restore).
    pub fn sever(&self) {
        {
            let mut state = self.lock();
            state.available = false;
            for end in state.ends.iter_mut() {
                end.drop_link("link severed");
            }
        }
        self.bump();
    }

    /// Bring a severed link back.
    pub fn restore(&self) {
        {
            let mut state = self.lock();
            state.available = true;
        }
        self.bump();
    }

    /// Check if this endpoint is connected.
    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        state.ends[self.side].connected
    }

    fn peer_side(&self) -> usize {
        1 - self.side
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.link
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.link.generation.send_modify(|g| *g += 1);
    }

    /// Check that this end is connected and the peer listens on `channel`.
    fn check_deliverable(&self, state: &LinkState, channel: Channel) -> Result<(), TransportError> {
        if !state.ends[self.side].connected {
            return Err(TransportError::LinkLost("link dropped mid-write".into()));
        }
        let peer = &state.ends[self.peer_side()];
        if !peer.connected || !peer.subscriptions.contains(&channel) {
            return Err(TransportError::WriteFailed {
                channel,
                reason: "peer is not listening".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn establish(&self, _role: Role) -> Result<PeerId, TransportError> {
        let mut changes = self.link.generation.subscribe();
        {
            let mut state = self.lock();
            state.ends[self.side].linking = true;
        }
        self.bump();

        loop {
            {
                let mut state = self.lock();
                let peer = self.peer_side();
                if state.available && (state.ends[peer].linking || state.ends[peer].connected) {
                    let end = &mut state.ends[self.side];
                    end.connected = true;
                    end.unit_size = self.link.config.max_unit_size;
                    end.subscriptions.clear();
                    return Ok(state.ends[peer].id.clone());
                }
            }
            changes
                .changed()
                .await
                .map_err(|_| TransportError::EstablishFailed("link closed".into()))?;
        }
    }

    async fn negotiate_unit_size(&self, requested: usize) -> Result<usize, TransportError> {
        let mut state = self.lock();
        let end = &mut state.ends[self.side];
        if !end.connected {
            return Err(TransportError::NotConnected);
        }
        end.unit_size = requested.min(self.link.config.max_unit_size);
        Ok(end.unit_size)
    }

    async fn subscribe(&self, channel: Channel) -> Result<(), TransportError> {
        let mut state = self.lock();
        let end = &mut state.ends[self.side];
        if !end.connected {
            return Err(TransportError::NotConnected);
        }
        end.subscriptions.insert(channel);
        Ok(())
    }

    async fn write(&self, channel: Channel, bytes: &[u8]) -> Result<(), TransportError> {
        let unit_size = {
            let state = self.lock();
            if !state.ends[self.side].connected {
                return Err(TransportError::NotConnected);
            }
            self.check_deliverable(&state, channel)?;
            state.ends[self.side].unit_size.max(1)
        };

        let gap = self.link.config.fragment_gap;
        for (index, chunk) in bytes.chunks(unit_size).enumerate() {
            if index > 0 && !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
            let state = self.lock();
            self.check_deliverable(&state, channel)?;
            let _ = state.ends[self.peer_side()].events_tx.send(LinkEvent::Fragment {
                peer: state.ends[self.side].id.clone(),
                channel,
                bytes: chunk.to_vec(),
            });
        }
        Ok(())
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let response = {
            let state = self.lock();
            if !state.ends[self.side].connected {
                return Err(TransportError::NotConnected);
            }
            let peer = &state.ends[self.peer_side()];
            if !peer.connected {
                return Err(TransportError::ReadFailed {
                    channel,
                    reason: "peer is not connected".into(),
                });
            }
            let (reply, response) = oneshot::channel();
            peer.events_tx
                .send(LinkEvent::ReadRequest { channel, reply })
                .map_err(|_| TransportError::ReadFailed {
                    channel,
                    reason: "peer is gone".into(),
                })?;
            response
        };

        match tokio::time::timeout(READ_TIMEOUT, response).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(TransportError::ReadFailed {
                channel,
                reason: "peer declined the read".into(),
            }),
            Err(_) => Err(TransportError::ReadFailed {
                channel,
                reason: "read timed out".into(),
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            let peer = self.peer_side();
            state.ends[peer].drop_link("peer disconnected");
            let end = &mut state.ends[self.side];
            end.linking = false;
            end.connected = false;
            end.subscriptions.clear();
        }
        self.bump();
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        let mut state = self.lock();
        state.ends[self.side].events_rx.take()
    }
}
