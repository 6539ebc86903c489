//! Reusable ciphertext scratch buffers.
//!
//! One `Scratch` lives in each socket and is shared by its successive
//! operations: an outbound staging area (ciphertext pulled out of the
//! engine, with a cursor over the unsent remainder) and an inbound read
//! buffer for draining the kernel. Both start at 16 KiB, grow by doubling
//! up to the 64 KiB drain quantum, and never shrink while the connection
//! lives.

use crate::engine::TlsEngine;

/// Initial capacity of both scratch areas.
pub(crate) const MIN_CAPACITY: usize = 16 * 1024;
/// Maximum bytes staged or drained per iteration.
pub(crate) const DRAIN_QUANTUM: usize = 64 * 1024;

pub(crate) struct Scratch {
    chunk: Vec<u8>,
    len: usize,
    pos: usize,
    read_buf: Vec<u8>,
}

impl Scratch {
    pub(crate) fn new() -> Self {
        Self {
            chunk: vec![0; MIN_CAPACITY],
            len: 0,
            pos: 0,
            read_buf: vec![0; MIN_CAPACITY],
        }
    }

    /// Whether the staged chunk has been fully sent.
    pub(crate) fn is_drained(&self) -> bool {
        self.pos >= self.len
    }

    /// The unsent remainder of the staged chunk.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.chunk[self.pos..self.len]
    }

    /// Advance the send cursor by `n` bytes.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.len);
        self.pos += n;
    }

    /// Refill the staged chunk from the engine's outbound queue.
    ///
    /// Returns the number of bytes staged; zero means the queue is empty.
    /// The chunk is sized to `max(16 KiB, min(pending, 64 KiB))`, growing
    /// by doubling.
    pub(crate) fn stage_from(&mut self, engine: &mut TlsEngine) -> usize {
        debug_assert!(self.is_drained());
        let pending = engine.pending_encrypted_output();
        if pending == 0 {
            self.len = 0;
            self.pos = 0;
            return 0;
        }

        let target = pending.clamp(MIN_CAPACITY, DRAIN_QUANTUM);
        let mut capacity = self.chunk.len();
        while capacity < target {
            capacity = (capacity * 2).min(DRAIN_QUANTUM);
        }
        if capacity > self.chunk.len() {
            self.chunk.resize(capacity, 0);
        }

        let n = engine.extract_encrypted_output(&mut self.chunk[..capacity]);
        self.len = n;
        self.pos = 0;
        n
    }

    /// The inbound read buffer, grown by doubling when a previous drain
    /// filled it completely.
    pub(crate) fn read_buf(&mut self) -> &mut [u8] {
        &mut self.read_buf
    }

    /// Note that the last kernel read filled the whole buffer, so the next
    /// one gets a larger bite (up to the drain quantum).
    pub(crate) fn note_full_read(&mut self) {
        let capacity = self.read_buf.len();
        if capacity < DRAIN_QUANTUM {
            self.read_buf.resize((capacity * 2).min(DRAIN_QUANTUM), 0);
        }
    }
}
