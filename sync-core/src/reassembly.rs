//! Fragment buffer for poster-sync.
//!
//! The link's single-write capacity is far smaller than a serialized
//! request collection, so one logical message arrives as an unknown number
//! of transport fragments. This buffer accumulates them for one
//! `(peer, channel)` stream:
//! - fragments are appended in arrival order
//! - the total size is capped to bound memory
//! - `take()` hands over the complete message and resets the buffer
//!
//! Deciding *when* a message is complete (the quiescence timer) is the
//! caller's job; see sync-client's reassembly actor.

use poster_sync_types::{Channel, MAX_PAYLOAD_SIZE};

/// Error type for buffer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Appending the fragment would exceed the buffer capacity.
    Overflow {
        /// Buffer capacity in bytes.
        capacity: usize,
        /// Bytes the buffer would have held.
        attempted: usize,
    },
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Overflow {
                capacity,
                attempted,
            } => {
                write!(
                    f,
                    "fragment buffer overflow ({} bytes, capacity: {})",
                    attempted, capacity
                )
            }
        }
    }
}

impl std::error::Error for BufferError {}

/// Accumulates fragments of one logical message.
#[derive(Debug)]
pub struct FragmentBuffer {
    channel: Channel,
    capacity: usize,
    bytes: Vec<u8>,
    fragments: usize,
}

impl FragmentBuffer {
    /// Create an empty buffer for `channel` capped at [`MAX_PAYLOAD_SIZE`].
    pub fn new(channel: Channel) -> Self {
        Self::with_capacity(channel, MAX_PAYLOAD_SIZE)
    }

    /// Create an empty buffer with an explicit byte cap.
    pub fn with_capacity(channel: Channel, capacity: usize) -> Self {
        Self {
            channel,
            capacity,
            bytes: Vec::new(),
            fragments: 0,
        }
    }

    /// Channel the fragments belong to.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Append a fragment.
    ///
    /// On overflow the accumulated bytes are discarded: a partial message
    /// is never handed to the decoder.
    pub fn push(&mut self, fragment: &[u8]) -> Result<(), BufferError> {
        let attempted = self.bytes.len() + fragment.len();
        if attempted > self.capacity {
            self.clear();
            return Err(BufferError::Overflow {
                capacity: self.capacity,
                attempted,
            });
        }
        self.bytes.extend_from_slice(fragment);
        self.fragments += 1;
        Ok(())
    }

    /// Hand over the accumulated message and reset.
    pub fn take(&mut self) -> Vec<u8> {
        self.fragments = 0;
        std::mem::take(&mut self.bytes)
    }

    /// Drop everything accumulated so far.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.fragments = 0;
    }

    /// Bytes accumulated.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of fragments accumulated.
    pub fn fragment_count(&self) -> usize {
        self.fragments
    }
}
