use std::fmt;
use std::io::IoSlice;

use super::{ByteBuf, Pool, Pooled};

/// An insertion cursor was invalidated by a later write on its chain.
#[derive(Debug, PartialEq)]
pub struct StaleInsert;

/// An ordered chain of read-mode buffers plus a trailing partial buffer,
/// built for vectored writes.
///
/// String data lands in pooled buffers; externally built buffers are moved
/// in whole, so a response body is never copied into the chain. The chain
/// owns every buffer until `clear` (or drop) releases the pooled ones.
pub struct BufChain {
    pool: Pool<ByteBuf>,
    segs: Vec<Seg>,
    current: Option<Pooled<ByteBuf>>,
    epoch: u64,
}

enum Seg {
    Pooled(Pooled<ByteBuf>),
    Plain(ByteBuf),
}

impl Seg {
    fn buf(&self) -> &ByteBuf {
        match *self {
            Seg::Pooled(ref p) => p,
            Seg::Plain(ref b) => b,
        }
    }

    fn buf_mut(&mut self) -> &mut ByteBuf {
        match *self {
            Seg::Pooled(ref mut p) => p,
            Seg::Plain(ref mut b) => b,
        }
    }
}

impl BufChain {
    pub fn new(pool: Pool<ByteBuf>) -> BufChain {
        BufChain {
            pool,
            segs: Vec::new(),
            current: None,
            epoch: 0,
        }
    }

    /// Total unread bytes: committed buffers plus the partial current one.
    pub fn remaining(&self) -> usize {
        let committed: usize = self.segs.iter().map(|s| s.buf().remaining()).sum();
        committed + self.current.as_ref().map_or(0, |c| c.position())
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    /// Appends bytes, spilling across pooled buffers as they fill.
    pub fn write(&mut self, src: &[u8]) {
        self.epoch += 1;
        write_into(&self.pool, &mut self.segs, &mut self.current, src);
    }

    /// Appends an externally built read-mode buffer without copying it.
    pub fn append_buf(&mut self, buf: ByteBuf) {
        self.epoch += 1;
        self.commit_current();
        self.segs.push(Seg::Plain(buf));
    }

    /// Opens an insertion cursor at the front of the chain.
    pub fn insert_front(&mut self) -> Inserter {
        self.commit_current();
        Inserter::new(self, 0)
    }

    /// Opens an insertion cursor at the back of the chain.
    pub fn insert_back(&mut self) -> Inserter {
        self.commit_current();
        let at = self.segs.len();
        Inserter::new(self, at)
    }

    /// Splices a cursor's buffers into place. Fails if the chain was
    /// written directly since the cursor was opened.
    pub fn close_insert(&mut self, mut ins: Inserter) -> Result<(), StaleInsert> {
        if ins.epoch != self.epoch {
            return Err(StaleInsert);
        }
        ins.commit_current();
        let at = ins.at;
        self.segs.splice(at..at, ins.segs.drain(..));
        self.epoch += 1;
        Ok(())
    }

    /// Commits the trailing partial buffer; the chain is then entirely
    /// read-mode and ready for vectored output.
    pub fn finish(&mut self) {
        self.commit_current();
    }

    fn commit_current(&mut self) {
        if let Some(mut cur) = self.current.take() {
            if cur.position() > 0 {
                cur.flip();
                self.segs.push(Seg::Pooled(cur));
            }
        }
    }

    /// The unread committed windows, for `write_vectored`.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.segs
            .iter()
            .filter(|s| s.buf().has_remaining())
            .map(|s| IoSlice::new(s.buf().bytes()))
            .collect()
    }

    /// Consumes `n` bytes from the front of the committed windows.
    pub fn advance(&mut self, mut n: usize) {
        for seg in &mut self.segs {
            if n == 0 {
                break;
            }
            let buf = seg.buf_mut();
            let take = ::std::cmp::min(n, buf.remaining());
            buf.advance(take);
            n -= take;
        }
        debug_assert_eq!(n, 0, "advanced past end of chain");
    }

    /// Releases every buffer; pooled ones flow back to the pool.
    pub fn clear(&mut self) {
        self.segs.clear();
        self.current = None;
        self.epoch += 1;
    }
}

impl fmt::Debug for BufChain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufChain")
            .field("segs", &self.segs.len())
            .field("remaining", &self.remaining())
            .finish()
    }
}

fn write_into(
    pool: &Pool<ByteBuf>,
    segs: &mut Vec<Seg>,
    current: &mut Option<Pooled<ByteBuf>>,
    mut src: &[u8],
) {
    while !src.is_empty() {
        if current.is_none() {
            *current = Some(pool.acquire());
        }
        let full = {
            let cur = current.as_mut().expect("current buffer just ensured");
            let n = cur.put_slice(src);
            src = &src[n..];
            !cur.has_remaining()
        };
        if full {
            let mut cur = current.take().expect("current buffer just filled");
            cur.flip();
            segs.push(Seg::Pooled(cur));
        }
    }
}

/// A pending insertion into a [`BufChain`].
///
/// Accumulates its own buffers and splices them in at `close_insert`. Any
/// direct write on the chain invalidates the cursor.
pub struct Inserter {
    at: usize,
    epoch: u64,
    pool: Pool<ByteBuf>,
    segs: Vec<Seg>,
    current: Option<Pooled<ByteBuf>>,
}

impl Inserter {
    fn new(chain: &BufChain, at: usize) -> Inserter {
        Inserter {
            at,
            epoch: chain.epoch,
            pool: chain.pool.clone(),
            segs: Vec::new(),
            current: None,
        }
    }

    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    pub fn write(&mut self, src: &[u8]) {
        write_into(&self.pool, &mut self.segs, &mut self.current, src);
    }

    fn commit_current(&mut self) {
        if let Some(mut cur) = self.current.take() {
            if cur.position() > 0 {
                cur.flip();
                self.segs.push(Seg::Pooled(cur));
            }
        }
    }
}
