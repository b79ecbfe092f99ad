//! # Utterance Buffer
//!
//! Accumulates the raw PCM bytes a device streams between the handshake and
//! the end-of-stream marker. Frames are concatenated in arrival order with no
//! re-framing, so an odd-sized frame is kept as-is.
//!
//! The buffer is owned by a single connection and is never shared between
//! threads, so it is a plain `Vec<u8>` rather than the locked ring buffers used
//! for continuous streaming.

use std::fmt;

/// Returned when an append would push the buffer past its byte limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOverflow {
    pub limit: usize,
    pub attempted: usize,
}

impl fmt::Display for BufferOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "utterance exceeds {} bytes ({} bytes attempted)",
            self.limit, self.attempted
        )
    }
}

impl std::error::Error for BufferOverflow {}

/// Growable byte buffer for one utterance.
#[derive(Debug, Default)]
pub struct UtteranceBuffer {
    data: Vec<u8>,
    /// Upper bound on the buffered bytes; `None` means unbounded.
    limit: Option<usize>,
}

impl UtteranceBuffer {
    /// Create a buffer that refuses to grow beyond `limit` bytes, if set.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    /// Append one binary frame.
    ///
    /// On overflow the buffer is left untouched so the caller can decide
    /// whether to drop the utterance.
    pub fn append(&mut self, frame: &[u8]) -> Result<(), BufferOverflow> {
        let attempted = self.data.len() + frame.len();
        if let Some(limit) = self.limit {
            if attempted > limit {
                return Err(BufferOverflow { limit, attempted });
            }
        }
        self.data.extend_from_slice(frame);
        Ok(())
    }

    /// Hand the accumulated bytes to the caller and leave the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
