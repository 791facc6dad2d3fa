//! Bounded circular byte buffer.
//!
//! Connects the streamed-response producer (handler thread) to its single
//! consumer (the connection task). This type is the pure data structure;
//! blocking and wakeups live in [`crate::http::generator`].
//!
//! # Invariants
//!
//! - Capacity never changes after construction.
//! - `full` is true iff `write_pos == read_pos` after a write that filled
//!   the buffer; when `full` is false and the positions are equal, the
//!   buffer is empty.
//! - Bytes are read back in exactly the order they were written, for any
//!   interleaving of chunked writes and reads.

/// Fixed-capacity circular byte queue.
pub struct RingBuffer {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    full: bool,
}

impl RingBuffer {
    /// Creates a ring buffer with the given capacity (must be at least 1).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 1, "ring buffer capacity must be at least 1");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            full: false,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered bytes available to read.
    pub fn len(&self) -> usize {
        if self.full {
            self.buf.len()
        } else if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.buf.len() - self.read_pos + self.write_pos
        }
    }

    /// Free space available to write.
    pub fn free(&self) -> usize {
        self.buf.len() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.read_pos == self.write_pos
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Copies as much of `data` as fits, returning the number of bytes
    /// accepted. Never blocks.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        if n == 0 {
            return 0;
        }

        // At most two segments: write_pos..capacity, then 0..rest.
        let first = n.min(self.buf.len() - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = n - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..n]);
        }

        self.write_pos = (self.write_pos + n) % self.buf.len();
        if self.write_pos == self.read_pos {
            self.full = true;
        }
        n
    }

    /// Copies up to `out.len()` buffered bytes into `out`, returning the
    /// number of bytes copied. Returns 0 when empty; never blocks.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        if n == 0 {
            return 0;
        }

        let first = n.min(self.buf.len() - self.read_pos);
        out[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        let rest = n - first;
        if rest > 0 {
            out[first..n].copy_from_slice(&self.buf[..rest]);
        }

        self.read_pos = (self.read_pos + n) % self.buf.len();
        self.full = false;
        n
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.full = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let mut ring = RingBuffer::with_capacity(8);
        assert_eq!(ring.write(b"hello"), 5);
        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn full_flag_after_exact_fill() {
        let mut ring = RingBuffer::with_capacity(4);
        assert_eq!(ring.write(b"abcd"), 4);
        assert!(ring.is_full());
        assert_eq!(ring.write(b"e"), 0);
        let mut out = [0u8; 1];
        assert_eq!(ring.read(&mut out), 1);
        assert!(!ring.is_full());
        assert_eq!(ring.write(b"e"), 1);
    }

    #[test]
    fn wrap_around_preserves_order() {
        let mut ring = RingBuffer::with_capacity(4);
        let mut out = [0u8; 4];
        ring.write(b"abc");
        assert_eq!(ring.read(&mut out[..2]), 2);
        ring.write(b"def");
        let mut collected = Vec::new();
        loop {
            let n = ring.read(&mut out);
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&out[..n]);
        }
        assert_eq!(collected, b"cdef");
    }
}
