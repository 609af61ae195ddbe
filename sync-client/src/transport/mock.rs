//! Mock transport for testing.
//!
//! Allows scripting failures, queueing read responses, injecting peer events
//! and capturing written messages for verification.

use super::{LinkEvent, Transport, TransportError};
use async_trait::async_trait;
use poster_sync_core::Role;
use poster_sync_types::{Channel, PeerId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Unit size the mock negotiates unless told otherwise.
const DEFAULT_UNIT_SIZE: usize = 512;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one clone while the engine owns
/// another.
#[derive(Debug)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug)]
struct MockTransportInner {
    peer: PeerId,
    connected: bool,
    unit_size: usize,
    subscriptions: Vec<Channel>,
    written: Vec<(Channel, Vec<u8>)>,
    write_attempts: usize,
    read_queue: VecDeque<(Channel, Vec<u8>)>,
    disconnects: usize,
    fail_next_establish: Option<String>,
    fail_next_writes: (usize, String),
    failing_needles: Vec<Vec<u8>>,
    fail_next_read: Option<String>,
    stall_writes: bool,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl MockTransport {
    /// Create a new mock transport whose peer is `mock-peer`.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner {
                peer: PeerId::new("mock-peer"),
                connected: false,
                unit_size: DEFAULT_UNIT_SIZE,
                subscriptions: Vec::new(),
                written: Vec::new(),
                write_attempts: 0,
                read_queue: VecDeque::new(),
                disconnects: 0,
                fail_next_establish: None,
                fail_next_writes: (0, String::new()),
                failing_needles: Vec::new(),
                fail_next_read: None,
                stall_writes: false,
                events_tx,
                events_rx: Some(events_rx),
            })),
        }
    }

    /// Set the unit size returned by negotiation.
    pub fn set_unit_size(&self, unit_size: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.unit_size = unit_size;
    }

    /// Queue a response for the next `read()` of `channel`.
    pub fn queue_read(&self, channel: Channel, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_queue.push_back((channel, data));
    }

    /// Deliver an event as if the peer or link produced it.
    pub fn inject(&self, event: LinkEvent) {
        let inner = self.inner.lock().unwrap();
        let _ = inner.events_tx.send(event);
    }

    /// Drop the link and report it on the event stream.
    pub fn drop_link(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.subscriptions.clear();
        let _ = inner.events_tx.send(LinkEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Get all messages that were acknowledged, with their channel.
    pub fn written(&self) -> Vec<(Channel, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        inner.written.clone()
    }

    /// Get the messages acknowledged on one channel.
    pub fn written_on(&self, channel: Channel) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .written
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// Number of `write()` calls, successful or not.
    pub fn write_attempts(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.write_attempts
    }

    /// Channels currently subscribed.
    pub fn subscriptions(&self) -> Vec<Channel> {
        let inner = self.inner.lock().unwrap();
        inner.subscriptions.clone()
    }

    /// Number of `disconnect()` calls.
    pub fn disconnect_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.disconnects
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    /// Cause the next establish() to fail with the given error.
    pub fn fail_next_establish(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_establish = Some(error.to_string());
    }

    /// Cause the next `count` writes to fail with the given error.
    pub fn fail_next_writes(&self, count: usize, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_writes = (count, error.to_string());
    }

    /// Fail every write whose bytes contain `needle`.
    pub fn fail_writes_containing(&self, needle: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.failing_needles.push(needle.to_vec());
    }

    /// Cause the next read() to fail with the given error.
    pub fn fail_next_read(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_read = Some(error.to_string());
    }

    /// Make every write hang until it is cancelled.
    pub fn stall_writes(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stall_writes = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn establish(&self, _role: Role) -> Result<PeerId, TransportError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_establish.take() {
            return Err(TransportError::EstablishFailed(error));
        }

        inner.connected = true;
        Ok(inner.peer.clone())
    }

    async fn negotiate_unit_size(&self, requested: usize) -> Result<usize, TransportError> {
        let inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(requested.min(inner.unit_size))
    }

    async fn subscribe(&self, channel: Channel) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if !inner.subscriptions.contains(&channel) {
            inner.subscriptions.push(channel);
        }
        Ok(())
    }

    async fn write(&self, channel: Channel, bytes: &[u8]) -> Result<(), TransportError> {
        let stall = {
            let mut inner = self.inner.lock().unwrap();
            inner.write_attempts += 1;

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }

            // Check for forced failure
            if inner.fail_next_writes.0 > 0 {
                inner.fail_next_writes.0 -= 1;
                return Err(TransportError::WriteFailed {
                    channel,
                    reason: inner.fail_next_writes.1.clone(),
                });
            }
            if inner
                .failing_needles
                .iter()
                .any(|needle| bytes.windows(needle.len()).any(|w| w == needle.as_slice()))
            {
                return Err(TransportError::WriteFailed {
                    channel,
                    reason: "rejected by peer".into(),
                });
            }

            if !inner.stall_writes {
                inner.written.push((channel, bytes.to_vec()));
            }
            inner.stall_writes
        };

        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(reason) = inner.fail_next_read.take() {
            return Err(TransportError::ReadFailed { channel, reason });
        }

        let position = inner.read_queue.iter().position(|(c, _)| *c == channel);
        match position.and_then(|i| inner.read_queue.remove(i)) {
            Some((_, bytes)) => Ok(bytes),
            None => Err(TransportError::ReadFailed {
                channel,
                reason: "no response queued".into(),
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.subscriptions.clear();
        inner.disconnects += 1;
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        let mut inner = self.inner.lock().unwrap();
        inner.events_rx.take()
    }
}
