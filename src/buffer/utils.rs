//! Stateless helpers over ordered sequences of buffers.
//!
//! A logical message can span several pooled buffers, so the framing layer
//! needs to peek and extract byte runs that cross buffer boundaries. These
//! functions treat a slice of buffers as one contiguous byte stream, consumed
//! strictly in sequence order.

use super::PoolBuffer;

/// A readable cursor over some backing bytes.
///
/// Implemented by [`PoolBuffer`] (consuming reads) and [`BufferView`]
/// (non-consuming peeks over the same bytes).
pub trait ReadableBuffer {
    /// Bytes left to read.
    fn remaining(&self) -> usize;

    /// Copies up to `dst.len()` bytes into `dst`, advancing this cursor.
    /// Returns the number of bytes copied.
    fn copy_into(&mut self, dst: &mut [u8]) -> usize;
}

impl ReadableBuffer for PoolBuffer {
    fn remaining(&self) -> usize {
        PoolBuffer::remaining(self)
    }

    fn copy_into(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.remaining());
        dst[..count].copy_from_slice(&self.readable_slice()[..count]);
        self.advance(count);
        count
    }
}

/// An independent read cursor over a buffer's readable bytes.
///
/// Shares the backing storage of the source buffer but owns its position, so
/// advancing a view never disturbs the source. Produced by [`duplicate`].
#[derive(Debug)]
pub struct BufferView<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BufferView<'a> {
    /// Creates a read cursor over `data`, positioned at the start.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }
}

impl ReadableBuffer for BufferView<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn copy_into(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.remaining());
        dst[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        count
    }
}

/// Returns independent read views over `buffers`, preserving order.
///
/// Each view starts at its source buffer's current position; reading through
/// a view has no effect on the source.
pub fn duplicate(buffers: &[PoolBuffer]) -> Vec<BufferView<'_>> {
    buffers
        .iter()
        .map(|buffer| BufferView {
            data: buffer.readable_slice(),
            position: 0,
        })
        .collect()
}

/// Copies `min(destination.remaining, source.remaining)` bytes from `source`
/// into `destination`, advancing both cursors. Never overflows the
/// destination. Returns the number of bytes copied.
pub fn fill(destination: &mut PoolBuffer, source: &mut impl ReadableBuffer) -> usize {
    let count = destination.remaining().min(source.remaining());
    let copied = source.copy_into(&mut destination.writable_slice()[..count]);
    debug_assert_eq!(copied, count);
    destination.advance(count);
    count
}

/// True iff the total remaining bytes across `buffers` is at least `length`.
///
/// An empty slice with `length == 0` is `true`.
pub fn has_remaining<B: ReadableBuffer>(buffers: &[B], length: usize) -> bool {
    let mut total = 0usize;
    for buffer in buffers {
        total += buffer.remaining();
        if total >= length {
            return true;
        }
    }
    total >= length
}

/// Extracts exactly `length` bytes from `buffers` in sequence order.
///
/// If fewer than `length` bytes remain in total, returns `None` without
/// consuming anything. Otherwise each source buffer's position advances by
/// the amount it contributed. A `length == 0` call always succeeds with an
/// empty vec and consumes nothing.
///
/// The all-or-nothing boundary is deliberate: the framing layer relies on
/// "unavailable" never meaning "partially consumed".
pub fn get<B: ReadableBuffer>(buffers: &mut [B], length: usize) -> Option<Vec<u8>> {
    if !has_remaining(&*buffers, length) {
        return None;
    }

    let mut result = vec![0u8; length];
    let mut taken = 0usize;
    for buffer in buffers.iter_mut() {
        if taken == length {
            break;
        }
        taken += buffer.copy_into(&mut result[taken..]);
    }
    debug_assert_eq!(taken, length);
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Four 4-byte read-mode buffers holding 0x00..=0x0F.
    fn sample_buffers() -> Vec<PoolBuffer> {
        (0u8..4)
            .map(|i| PoolBuffer::from_bytes(&[4 * i, 4 * i + 1, 4 * i + 2, 4 * i + 3]))
            .collect()
    }

    #[test]
    fn get_beyond_remaining_is_unavailable() {
        let mut buffers = sample_buffers();
        assert!(get(&mut buffers, 17).is_none());
        for buffer in &buffers {
            assert_eq!(buffer.position(), 0);
        }
    }

    #[test]
    fn get_zero_succeeds_and_consumes_nothing() {
        let mut buffers = sample_buffers();
        assert_eq!(get(&mut buffers, 0), Some(Vec::new()));
        for buffer in &buffers {
            assert_eq!(buffer.position(), 0);
        }
    }

    #[test]
    fn get_spans_buffer_boundary() {
        let mut buffers = sample_buffers();
        let bytes = get(&mut buffers, 6).unwrap();
        assert_eq!(bytes, &[0, 1, 2, 3, 4, 5]);
        assert_eq!(buffers[0].position(), 4);
        assert_eq!(buffers[1].position(), 2);
        assert_eq!(buffers[2].position(), 0);
    }

    #[test]
    fn get_exact_total_drains_everything() {
        let mut buffers = sample_buffers();
        let bytes = get(&mut buffers, 16).unwrap();
        assert_eq!(bytes, (0u8..16).collect::<Vec<_>>());
        for buffer in &buffers {
            assert!(!buffer.has_remaining());
        }
    }

    #[test]
    fn has_remaining_boundaries() {
        let empty: Vec<PoolBuffer> = Vec::new();
        assert!(has_remaining(&empty, 0));
        assert!(!has_remaining(&empty, 1));

        let buffers = sample_buffers();
        assert!(has_remaining(&buffers, 16));
        assert!(!has_remaining(&buffers, 17));
    }

    #[test]
    fn duplicate_views_are_independent() {
        let buffers = sample_buffers();
        let mut views = duplicate(&buffers);
        let bytes = get(&mut views, 6).unwrap();
        assert_eq!(bytes, &[0, 1, 2, 3, 4, 5]);
        // Sources untouched.
        for buffer in &buffers {
            assert_eq!(buffer.position(), 0);
        }
    }

    #[test]
    fn fill_copies_min_of_both_remainders() {
        let mut destination = PoolBuffer::with_capacity(4);
        let mut source = PoolBuffer::from_bytes(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(fill(&mut destination, &mut source), 4);
        assert_eq!(destination.position(), 4);
        assert_eq!(source.position(), 4);

        let mut small_source = PoolBuffer::from_bytes(&[9]);
        let mut destination = PoolBuffer::with_capacity(4);
        assert_eq!(fill(&mut destination, &mut small_source), 1);
        assert_eq!(destination.position(), 1);
        assert!(!small_source.has_remaining());
    }
}
