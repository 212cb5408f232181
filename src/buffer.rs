//! Fixed-capacity circular byte buffer used for both the ingress and egress
//! side of a [`crate::session::Session`].
//!
//! Exposes contiguous read/write views so sockets can be read into, and
//! written out of, the buffer without an intermediate copy. Never resized
//! after construction.

/// A single-producer/single-consumer circular byte buffer.
///
/// `0 <= read_pos, write_pos < capacity`, `0 <= size <= capacity`, and
/// `(read_pos + size) % capacity == write_pos` holds at every observable
/// point (the ring-buffer invariant). Non-copyable: a `RingBuffer` is owned
/// exclusively by the `Session` it belongs to.
#[derive(Debug)]
pub(crate) struct RingBuffer {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    size: usize,
}

impl RingBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            size: 0,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.size == self.capacity()
    }

    /// Longest contiguous readable run, never spanning the wrap point.
    /// Callers needing a larger contiguous view must copy.
    pub(crate) fn read_view(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }

        let run = if self.write_pos > self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.capacity() - self.read_pos
        };

        &self.buf[self.read_pos..self.read_pos + run]
    }

    /// Longest contiguous writable run, never spanning the wrap point.
    pub(crate) fn write_view(&mut self) -> &mut [u8] {
        if self.is_full() {
            return &mut [];
        }

        let run = if self.write_pos >= self.read_pos {
            self.capacity() - self.write_pos
        } else {
            self.read_pos - self.write_pos
        };

        &mut self.buf[self.write_pos..self.write_pos + run]
    }

    /// Clamps `n` to `size`, matching the contract in [`RingBuffer`]'s docs.
    pub(crate) fn advance_read(&mut self, n: usize) {
        let n = n.min(self.size);
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.size -= n;
    }

    /// Clamps `n` to the available space.
    pub(crate) fn advance_write(&mut self, n: usize) {
        let n = n.min(self.capacity() - self.size);
        self.write_pos = (self.write_pos + n) % self.capacity();
        self.size += n;
    }

    pub(crate) fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.size = 0;
    }

    /// Copies up to `dest.len()` bytes out of the buffer, handling wraparound
    /// with at most two `copy_from_slice` calls. Returns the number copied.
    pub(crate) fn read(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.size);
        if n == 0 {
            return 0;
        }

        if self.read_pos + n <= self.capacity() {
            dest[..n].copy_from_slice(&self.buf[self.read_pos..self.read_pos + n]);
        } else {
            let first = self.capacity() - self.read_pos;
            dest[..first].copy_from_slice(&self.buf[self.read_pos..]);
            dest[first..n].copy_from_slice(&self.buf[..n - first]);
        }

        self.advance_read(n);
        n
    }

    /// Copies up to `dest.len()` bytes out of the buffer without advancing
    /// `read_pos`, handling wraparound with at most two `copy_from_slice`
    /// calls. Returns the number copied. Used by the request parser to take
    /// a linear snapshot of the unconsumed bytes before it knows how many
    /// of them a full request actually needs.
    pub(crate) fn peek(&self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.size);
        if n == 0 {
            return 0;
        }

        if self.read_pos + n <= self.capacity() {
            dest[..n].copy_from_slice(&self.buf[self.read_pos..self.read_pos + n]);
        } else {
            let first = self.capacity() - self.read_pos;
            dest[..first].copy_from_slice(&self.buf[self.read_pos..]);
            dest[first..n].copy_from_slice(&self.buf[..n - first]);
        }

        n
    }

    /// Copies up to `self.capacity() - self.size()` bytes from `src` into the
    /// buffer, handling wraparound with at most two `copy_from_slice` calls.
    pub(crate) fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.capacity() - self.size);
        if n == 0 {
            return 0;
        }

        if self.write_pos + n <= self.capacity() {
            self.buf[self.write_pos..self.write_pos + n].copy_from_slice(&src[..n]);
        } else {
            let first = self.capacity() - self.write_pos;
            self.buf[self.write_pos..].copy_from_slice(&src[..first]);
            self.buf[..n - first].copy_from_slice(&src[first..n]);
        }

        self.advance_write(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut rb = RingBuffer::new(16);
        assert_eq!(rb.write(b"hello"), 5);
        assert_eq!(rb.size(), 5);

        let mut out = [0u8; 5];
        assert_eq!(rb.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert!(rb.is_empty());
    }

    #[test]
    fn write_clamps_to_available_space() {
        let mut rb = RingBuffer::new(4);
        assert_eq!(rb.write(b"abcdef"), 4);
        assert!(rb.is_full());
        assert_eq!(rb.write(b"x"), 0);
    }

    #[test]
    fn wraparound_read_and_write() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef"); // size=6, write_pos=6
        let mut out = [0u8; 4];
        rb.read(&mut out); // read_pos=4, size=2
        assert_eq!(&out, b"abcd");

        // write_pos=6, capacity 8, writing 5 bytes wraps around
        assert_eq!(rb.write(b"ghijk"), 5);
        assert_eq!(rb.size(), 7);

        let mut out2 = [0u8; 7];
        rb.read(&mut out2);
        assert_eq!(&out2, b"efghijk");
    }

    #[test]
    fn advance_read_clamps_to_size() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"ab");
        rb.advance_read(100);
        assert_eq!(rb.size(), 0);
    }

    #[test]
    fn advance_write_then_advance_read_restores_size() {
        // RB2: advanceWrite(n) then advanceRead(n) restores the initial size.
        let mut rb = RingBuffer::new(8);
        rb.write(b"abc");
        let initial = rb.size();

        rb.advance_write(3);
        rb.advance_read(3);
        assert_eq!(rb.size(), initial);
    }

    #[test]
    fn read_view_never_spans_wrap_point() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef");
        let mut out = [0u8; 4];
        rb.read(&mut out);
        rb.write(b"ghijk");

        // read_pos=4, write_pos=(6+5)%8=3 -> contiguous run is capacity-read_pos=4
        let view = rb.read_view();
        assert_eq!(view.len(), 4);
        assert_eq!(view, b"efgh");
    }

    #[test]
    fn write_view_never_spans_wrap_point() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef");
        let mut out = [0u8; 6];
        rb.read(&mut out);
        // read_pos=6, write_pos=6, size=0: write_view should offer capacity-write_pos=2
        assert_eq!(rb.write_view().len(), 2);
    }

    #[test]
    fn peek_does_not_advance_read_pos() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(rb.peek(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(rb.size(), 6);

        let mut out2 = [0u8; 6];
        assert_eq!(rb.read(&mut out2), 6);
        assert_eq!(&out2, b"abcdef");
    }

    #[test]
    fn peek_handles_wraparound() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef");
        let mut discard = [0u8; 4];
        rb.read(&mut discard);
        rb.write(b"ghijk"); // wraps

        let mut out = [0u8; 7];
        assert_eq!(rb.peek(&mut out), 7);
        assert_eq!(&out, b"efghijk");
        assert_eq!(rb.size(), 7);
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef");
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.read_view().len(), 0);
    }
}
