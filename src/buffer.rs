//! Frame buffers passed from a producing unit to its listeners.
//!
//! A [`FrameBuffer`] is handed to listeners by reference for the duration of
//! a single notification. The payload is a [`Bytes`] handle, so a listener
//! that needs to keep the data past the callback clones the buffer (a
//! reference-count increment) instead of copying pixels.

use bytes::{Bytes, BytesMut};

/// Pixel data plus capture metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameBuffer {
    data: Bytes,
    bytes_used: usize,
    /// Capture time in microseconds on the monotonic clock.
    pub timestamp: i64,
    /// Per-producer frame counter.
    pub sequence: u64,
}

impl FrameBuffer {
    /// Wrap a payload. All of it counts as used.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            bytes_used: data.len(),
            data,
            timestamp: 0,
            sequence: 0,
        }
    }

    /// Allocate a zeroed buffer of `capacity` bytes with nothing used yet.
    pub fn with_capacity(capacity: usize) -> FrameBufferMut {
        FrameBufferMut {
            data: BytesMut::zeroed(capacity),
            bytes_used: 0,
            timestamp: 0,
            sequence: 0,
        }
    }

    /// Set the capture timestamp (µs).
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Limit the used portion of the payload.
    ///
    /// Values larger than the payload are clamped.
    pub fn with_bytes_used(mut self, bytes_used: usize) -> Self {
        self.bytes_used = bytes_used.min(self.data.len());
        self
    }

    /// The used portion of the payload.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.bytes_used]
    }

    /// The whole payload handle, including unused trailing space.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of valid bytes.
    #[inline]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Size of the underlying allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no bytes are used.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes_used == 0
    }
}

/// Writable frame under construction; freeze it to hand it to listeners.
#[derive(Debug)]
pub struct FrameBufferMut {
    data: BytesMut,
    bytes_used: usize,
    timestamp: i64,
    sequence: u64,
}

impl FrameBufferMut {
    /// Entire writable allocation.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Mark how many bytes were written.
    pub fn set_bytes_used(&mut self, bytes_used: usize) {
        self.bytes_used = bytes_used.min(self.data.len());
    }

    /// Set the capture timestamp (µs).
    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    /// Set the sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Make the frame immutable.
    pub fn freeze(self) -> FrameBuffer {
        FrameBuffer {
            data: self.data.freeze(),
            bytes_used: self.bytes_used,
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}
