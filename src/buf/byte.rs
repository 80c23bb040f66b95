use std::fmt;

use super::Reset;

/// A fixed-capacity buffer with a movable `[position, limit)` window.
///
/// The window is the writable space while appending and the unread data
/// after a `flip`. Parsers consume from the front of the window and
/// `compact` whatever they could not finish back to the start, so a
/// partially received line survives to the next read.
pub struct ByteBuf {
    data: Box<[u8]>,
    pos: usize,
    limit: usize,
}

impl ByteBuf {
    pub fn with_capacity(cap: usize) -> ByteBuf {
        ByteBuf {
            data: vec![0; cap].into_boxed_slice(),
            pos: 0,
            limit: cap,
        }
    }

    /// A read-mode buffer holding a copy of `bytes`, sized to fit.
    pub fn wrap(bytes: &[u8]) -> ByteBuf {
        let mut buf = ByteBuf::with_capacity(bytes.len());
        buf.put_slice(bytes);
        buf.flip();
        buf
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes left in the window: writable space while appending, unread
    /// data while reading.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.pos < self.limit
    }

    /// The current window.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.pos..self.limit]
    }

    /// The current window, writable.
    #[inline]
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..self.limit]
    }

    /// Moves the position forward after bytes were written into `space` or
    /// consumed from `bytes`.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.limit);
        self.pos += n;
    }

    /// Copies as much of `src` as fits, returning the copied count.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = ::std::cmp::min(src.len(), self.remaining());
        self.data[self.pos..self.pos + n].copy_from_slice(&src[..n]);
        self.pos += n;
        n
    }

    pub fn put_u8(&mut self, byte: u8) -> bool {
        if self.has_remaining() {
            self.data[self.pos] = byte;
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Switches from appending to reading: the filled region becomes the
    /// window.
    pub fn flip(&mut self) {
        self.limit = self.pos;
        self.pos = 0;
    }

    /// Empties the buffer and reopens the full capacity for appending.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.limit = self.capacity();
    }

    /// Moves the unread window to the front and reopens the tail for
    /// appending. Position afterwards is the preserved length.
    pub fn compact(&mut self) {
        let len = self.remaining();
        self.data.copy_within(self.pos..self.limit, 0);
        self.pos = len;
        self.limit = self.capacity();
    }
}

impl Reset for ByteBuf {
    fn reset(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("pos", &self.pos)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity())
            .finish()
    }
}
