//! Pooled fixed-capacity byte buffers.
//!
//! The reactor recycles receive and send buffers through a [`BufferPool`] to
//! avoid allocation churn on the I/O hot path. A logical message may span
//! several pooled buffers; the helpers in [`utils`] operate over such ordered
//! buffer sequences.

pub mod utils;

use tracing::trace;

/// A fixed-capacity byte buffer with cursor semantics.
///
/// A `PoolBuffer` tracks a `position` and a `limit` over its backing storage,
/// in the style of a classic I/O buffer: writes happen at `position` up to
/// `limit`, and after a [`flip`](Self::flip) reads happen at `position` up to
/// `limit`. The capacity never changes after construction.
#[derive(Debug)]
pub struct PoolBuffer {
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl PoolBuffer {
    /// Creates a new buffer with the given capacity, ready for writing
    /// (position 0, limit == capacity).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be non-zero");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    /// Creates a buffer in read mode holding a copy of `bytes`
    /// (position 0, limit == capacity == bytes.len()).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
            position: 0,
            limit: bytes.len(),
        }
    }

    /// The fixed capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The current cursor position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// The current limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes left between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// True if any bytes are left between position and limit.
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Resets to write mode: position 0, limit == capacity. Contents are not
    /// zeroed; stale bytes are never observable because reads stop at limit.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Switches from write mode to read mode: limit becomes the current
    /// position, position rewinds to 0.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// The writable region between position and limit.
    ///
    /// Pair with [`advance`](Self::advance) after writing into it.
    pub fn writable_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// The readable region between position and limit.
    pub fn readable_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Advances the position by `count` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the remaining bytes; that is a contract
    /// violation by the caller.
    pub fn advance(&mut self, count: usize) {
        assert!(
            count <= self.remaining(),
            "advance past limit: {} > {}",
            count,
            self.remaining()
        );
        self.position += count;
    }

    /// Copies `src` into the buffer at the current position and advances.
    ///
    /// # Panics
    ///
    /// Panics if `src` does not fit in the remaining space.
    pub fn put_slice(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.remaining(),
            "put overflows buffer: {} > {}",
            src.len(),
            self.remaining()
        );
        self.data[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
    }
}

/// Recycles fixed-capacity [`PoolBuffer`]s.
///
/// All buffers in a pool share one capacity, fixed at construction. The pool
/// is owned by the reactor thread and is not safe for concurrent use; by
/// construction no other thread ever touches it.
///
/// Ownership transfers on every operation: [`take`](Self::take) moves a buffer
/// out of the pool, [`put_back`](Self::put_back) moves it back in. A caller
/// must not retain any handle to a returned buffer; the move makes that
/// structurally impossible.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<PoolBuffer>,
    capacity: usize,
}

impl BufferPool {
    /// Creates an empty pool whose buffers all have `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be non-zero");
        Self {
            buffers: Vec::new(),
            capacity,
        }
    }

    /// The capacity of every buffer managed by this pool.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// Takes a buffer from the pool, allocating a fresh one if the pool is
    /// empty.
    ///
    /// The returned buffer is always cleared: position 0, limit == capacity.
    pub fn take(&mut self) -> PoolBuffer {
        match self.buffers.pop() {
            Some(buffer) => {
                trace!(pooled = self.buffers.len(), "Reusing pooled buffer");
                buffer
            }
            None => {
                trace!(capacity = self.capacity, "Allocating new pool buffer");
                PoolBuffer::with_capacity(self.capacity)
            }
        }
    }

    /// Clears `buffer` and stores it for reuse.
    ///
    /// # Panics
    ///
    /// Panics if the buffer's capacity does not match the pool's; mixing
    /// capacities is a contract violation.
    pub fn put_back(&mut self, mut buffer: PoolBuffer) {
        assert_eq!(
            buffer.capacity(),
            self.capacity,
            "foreign buffer returned to pool"
        );
        buffer.clear();
        self.buffers.push(buffer);
    }
}
