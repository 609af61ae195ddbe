//! Per-stream fragment reassembly.
//!
//! Each `(peer, channel)` stream gets its own actor task. The actor appends
//! fragments to a [`FragmentBuffer`] and restarts the quiescence timer on
//! every one; when the timer runs out without a new fragment, the buffer is
//! decoded and the result handed on. Append and flush happen inside one
//! task, so a late fragment can never race a flush.
//!
//! A flushed buffer may hold several messages the peer wrote back to back;
//! each one is handed on separately.

use poster_sync_core::{BufferError, FragmentBuffer};
use poster_sync_types::{Channel, CodecError, Payload, PeerId};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Why a buffered message could not be turned into a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// The message grew past the buffer cap and was discarded.
    #[error(transparent)]
    Overflow(#[from] BufferError),

    /// The concatenated bytes did not decode.
    #[error(transparent)]
    Malformed(#[from] CodecError),
}

/// One message taken from a flushed buffer.
#[derive(Debug)]
pub struct Reassembled {
    /// Sending peer.
    pub peer: PeerId,
    /// Channel the fragments arrived on.
    pub channel: Channel,
    /// Decoded payload, or why decoding failed.
    pub result: Result<Payload, ReassemblyError>,
}

/// Routes fragments to per-stream actors.
pub struct Reassembler {
    window: Duration,
    output: mpsc::UnboundedSender<Reassembled>,
    streams: HashMap<(PeerId, Channel), mpsc::UnboundedSender<Vec<u8>>>,
}

impl Reassembler {
    /// Create a reassembler that flushes after `window` of silence.
    pub fn new(window: Duration, output: mpsc::UnboundedSender<Reassembled>) -> Self {
        Self {
            window,
            output,
            streams: HashMap::new(),
        }
    }

    /// Feed one fragment. Must be called from within a tokio runtime.
    pub fn push(&mut self, peer: PeerId, channel: Channel, fragment: Vec<u8>) {
        self.streams.retain(|_, stream| !stream.is_closed());
        let key = (peer, channel);
        let fragment = match self.streams.get(&key) {
            Some(stream) => match stream.send(fragment) {
                Ok(()) => return,
                Err(mpsc::error::SendError(fragment)) => fragment,
            },
            None => fragment,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver was just created, so this cannot fail.
        let _ = tx.send(fragment);
        tokio::spawn(run_stream(
            key.0.clone(),
            channel,
            self.window,
            rx,
            self.output.clone(),
        ));
        self.streams.insert(key, tx);
    }

    /// End every stream. Each actor flushes what it holds and exits.
    ///
    /// Called when the link drops; the next peer starts with fresh streams.
    pub fn reset(&mut self) {
        if !self.streams.is_empty() {
            debug!(streams = self.streams.len(), "closing reassembly streams");
        }
        self.streams.clear();
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

async fn run_stream(
    peer: PeerId,
    channel: Channel,
    window: Duration,
    mut fragments: mpsc::UnboundedReceiver<Vec<u8>>,
    output: mpsc::UnboundedSender<Reassembled>,
) {
    let mut buffer = FragmentBuffer::new(channel);
    let mut overflow: Option<BufferError> = None;

    loop {
        let idle = buffer.is_empty() && overflow.is_none();
        let next = if idle {
            fragments.recv().await
        } else {
            match timeout(window, fragments.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    if !flush(&peer, channel, &mut buffer, &mut overflow, &output) {
                        return;
                    }
                    continue;
                }
            }
        };

        let Some(fragment) = next else {
            // Router gone: hand over whatever arrived.
            if !idle {
                flush(&peer, channel, &mut buffer, &mut overflow, &output);
            }
            return;
        };

        if overflow.is_some() {
            // Swallow the rest of an oversized message until it goes quiet.
            continue;
        }
        debug!(peer = %peer, channel = %channel, len = fragment.len(), "fragment received");
        if let Err(e) = buffer.push(&fragment) {
            overflow = Some(e);
        }
    }
}

/// Decode and emit the buffered messages. Returns false once nobody
/// listens.
fn flush(
    peer: &PeerId,
    channel: Channel,
    buffer: &mut FragmentBuffer,
    overflow: &mut Option<BufferError>,
    output: &mpsc::UnboundedSender<Reassembled>,
) -> bool {
    let results: Vec<Result<Payload, ReassemblyError>> = match overflow.take() {
        Some(e) => vec![Err(ReassemblyError::Overflow(e))],
        None => {
            let fragments = buffer.fragment_count();
            let bytes = buffer.take();
            debug!(peer = %peer, channel = %channel, fragments, len = bytes.len(), "flushing buffer");
            Payload::decode_all(channel, &bytes)
                .into_iter()
                .map(|result| result.map_err(ReassemblyError::from))
                .collect()
        }
    };
    buffer.clear();

    for result in results {
        if let Err(e) = &result {
            warn!(peer = %peer, channel = %channel, error = %e, "dropping inbound message");
        }
        let delivered = output
            .send(Reassembled {
                peer: peer.clone(),
                channel,
                result,
            })
            .is_ok();
        if !delivered {
            return false;
        }
    }
    true
}
