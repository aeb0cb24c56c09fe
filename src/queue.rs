//! Per-connection message buffering.
//!
//! [`InputQueue`] accumulates inbound bytes from non-blocking reads and yields
//! complete [`MessageEnvelope`]s; [`OutputQueue`] serializes outbound
//! envelopes into pooled buffers and tracks partial-write progress across
//! repeated non-blocking writes. Both draw their buffers from the reactor's
//! [`BufferPool`] and return fully drained buffers to it.

use crate::buffer::utils::{self, BufferView, ReadableBuffer};
use crate::buffer::{BufferPool, PoolBuffer};
use crate::envelope::MessageEnvelope;
use crate::error::Error;

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use tracing::trace;

/// Outcome of one [`InputQueue::fill_from`] pass.
#[derive(Debug, PartialEq, Eq)]
pub struct FillStatus {
    /// Number of bytes read during this pass.
    pub bytes_read: usize,
    /// True if the channel reported end-of-stream.
    pub end_of_stream: bool,
}

/// Accumulates inbound bytes into dequeueable message envelopes.
///
/// Buffered bytes live in an ordered sequence of pool buffers, consumed
/// strictly from the head. An envelope may span any number of buffers.
#[derive(Debug, Default)]
pub struct InputQueue {
    buffers: VecDeque<PoolBuffer>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total buffered bytes not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buffers.iter().map(PoolBuffer::remaining).sum()
    }

    /// Reads as many bytes as `channel` currently offers.
    ///
    /// Reads until the channel would block, reports end-of-stream, or fails,
    /// taking a fresh pool buffer whenever the current one fills.
    /// `Interrupted` reads are retried.
    pub fn fill_from<R: Read>(
        &mut self,
        channel: &mut R,
        pool: &mut BufferPool,
    ) -> std::io::Result<FillStatus> {
        let mut status = FillStatus {
            bytes_read: 0,
            end_of_stream: false,
        };
        let mut buffer = pool.take();

        loop {
            match channel.read(buffer.writable_slice()) {
                Ok(0) => {
                    status.end_of_stream = true;
                    break;
                }
                Ok(count) => {
                    trace!(len = count, "Read bytes into input queue");
                    buffer.advance(count);
                    status.bytes_read += count;
                    if !buffer.has_remaining() {
                        buffer.flip();
                        self.buffers.push_back(buffer);
                        buffer = pool.take();
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    pool.put_back(buffer);
                    return Err(err);
                }
            }
        }

        if buffer.position() > 0 {
            buffer.flip();
            self.buffers.push_back(buffer);
        } else {
            pool.put_back(buffer);
        }

        Ok(status)
    }

    /// Attempts to parse one complete envelope from the head of the buffered
    /// sequence.
    ///
    /// Peeks the fixed header to learn the body length; if fewer than
    /// header + body bytes are buffered, returns `Ok(None)` and the buffers
    /// are left untouched. Otherwise consumes exactly header + body bytes
    /// (crossing buffer boundaries transparently), returns the envelope, and
    /// hands fully drained buffers back to `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EnvelopeTooLarge`] for a header declaring an
    /// oversized body; the caller is expected to close the connection.
    pub fn dequeue_message_envelope(
        &mut self,
        pool: &mut BufferPool,
    ) -> Result<Option<MessageEnvelope>, Error> {
        // Peek the header through duplicate views so nothing is consumed if
        // the body has not fully arrived yet.
        let buffers = self.buffers.make_contiguous();
        let mut views = utils::duplicate(buffers);
        let Some(header_bytes) = utils::get(&mut views, MessageEnvelope::HEADER_LENGTH) else {
            return Ok(None);
        };
        let header: [u8; MessageEnvelope::HEADER_LENGTH] =
            header_bytes.try_into().expect("fixed-length get");
        let (id, correlation_id, body_len) = MessageEnvelope::decode_header(&header)?;

        if !utils::has_remaining(&*buffers, MessageEnvelope::HEADER_LENGTH + body_len) {
            return Ok(None);
        }

        // The full envelope is buffered; consume it for real.
        let header_consumed = utils::get(buffers, MessageEnvelope::HEADER_LENGTH);
        debug_assert!(header_consumed.is_some());
        let body = utils::get(buffers, body_len).expect("length was verified");

        while self
            .buffers
            .front()
            .is_some_and(|buffer| !buffer.has_remaining())
        {
            let drained = self.buffers.pop_front().expect("front exists");
            pool.put_back(drained);
        }

        trace!(id, correlation_id, body_len, "Dequeued message envelope");
        Ok(Some(MessageEnvelope::new(id, correlation_id, body)))
    }

    /// Returns every buffered byte's backing buffer to the pool.
    pub fn discard(&mut self, pool: &mut BufferPool) {
        for buffer in self.buffers.drain(..) {
            pool.put_back(buffer);
        }
    }
}

/// Serializes outbound envelopes and tracks partial-write progress.
///
/// Envelopes are flushed in enqueue order; a single envelope may occupy
/// several pooled buffers.
#[derive(Debug, Default)]
pub struct OutputQueue {
    buffers: VecDeque<PoolBuffer>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if serialized bytes are waiting to be written.
    pub fn has_pending(&self) -> bool {
        !self.buffers.is_empty()
    }

    /// Serializes `envelope` into pooled buffers appended to the queue.
    pub fn enqueue(&mut self, envelope: &MessageEnvelope, pool: &mut BufferPool) {
        let bytes = envelope.encode();
        let mut source = BufferView::new(&bytes);
        while source.remaining() > 0 {
            let mut buffer = pool.take();
            utils::fill(&mut buffer, &mut source);
            buffer.flip();
            self.buffers.push_back(buffer);
        }
        trace!(
            id = envelope.id(),
            len = envelope.total_length(),
            "Enqueued message envelope"
        );
    }

    /// Writes queued bytes to `channel` until the queue is empty or the
    /// channel would block. Returns `true` if bytes remain pending.
    /// `Interrupted` writes are retried; drained buffers go back to `pool`.
    pub fn drain_to<W: Write>(
        &mut self,
        channel: &mut W,
        pool: &mut BufferPool,
    ) -> std::io::Result<bool> {
        while let Some(buffer) = self.buffers.front_mut() {
            match channel.write(buffer.readable_slice()) {
                Ok(0) => break,
                Ok(count) => {
                    trace!(len = count, "Wrote bytes from output queue");
                    buffer.advance(count);
                    if !buffer.has_remaining() {
                        let drained = self.buffers.pop_front().expect("front exists");
                        pool.put_back(drained);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(self.has_pending())
    }

    /// Returns every queued buffer to the pool without writing it.
    pub fn discard(&mut self, pool: &mut BufferPool) {
        for buffer in self.buffers.drain(..) {
            pool.put_back(buffer);
        }
    }
}
