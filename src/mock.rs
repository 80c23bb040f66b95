//! In-memory connections for exercising the state machine without a
//! socket.

use std::collections::VecDeque;

use crate::buf::{BufChain, ByteBuf};
use crate::conn::{Callback, Connection, ErrorCallback};

/// A scriptable connection: `feed` plays the transport's receive side,
/// sends land in `sent` with their completions queued behind
/// `complete_sends`.
pub struct MockConn {
    in_buf: ByteBuf,
    out_buf: ByteBuf,
    recv_cb: Option<Callback>,
    recv_persistent: bool,
    pending: VecDeque<Callback>,
    pub sent: Vec<u8>,
    on_close: Option<Callback>,
    #[allow(dead_code)]
    on_error: Option<ErrorCallback>,
    closed: bool,
}

impl MockConn {
    pub fn new(cap: usize) -> MockConn {
        MockConn {
            in_buf: ByteBuf::with_capacity(cap),
            out_buf: ByteBuf::with_capacity(cap),
            recv_cb: None,
            recv_persistent: false,
            pending: VecDeque::new(),
            sent: Vec::new(),
            on_close: None,
            on_error: None,
            closed: false,
        }
    }

    /// Feeds bytes the way the transport would: fill the input buffer,
    /// deliver, repeat until everything is consumed or nobody listens.
    pub fn feed(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.closed || self.recv_cb.is_none() {
                return;
            }
            let n = self.in_buf.put_slice(bytes);
            bytes = &bytes[n..];
            self.deliver();
            if n == 0 && self.in_buf.remaining() == 0 {
                // no space and the app is not consuming
                return;
            }
        }
    }

    fn deliver(&mut self) {
        let mut cb = match self.recv_cb.take() {
            Some(cb) => cb,
            None => return,
        };
        self.in_buf.flip();
        cb(self);
        if self.recv_persistent && self.recv_cb.is_none() && !self.closed {
            self.recv_cb = Some(cb);
        }
    }

    /// Fires queued send completions (completions may queue more).
    /// Returns how many ran.
    pub fn complete_sends(&mut self) -> usize {
        let mut ran = 0;
        while let Some(mut cb) = self.pending.pop_front() {
            ran += 1;
            cb(self);
        }
        ran
    }
}

impl Connection for MockConn {
    fn in_buf(&mut self) -> &mut ByteBuf {
        &mut self.in_buf
    }

    fn out_buf(&mut self) -> &mut ByteBuf {
        &mut self.out_buf
    }

    fn recv(&mut self, cb: Callback) {
        self.recv_cb = Some(cb);
        self.recv_persistent = false;
    }

    fn recv_persistent(&mut self, cb: Callback) {
        self.recv_cb = Some(cb);
        self.recv_persistent = true;
    }

    fn cancel_recv(&mut self) {
        self.recv_cb = None;
        self.recv_persistent = false;
    }

    fn send(&mut self, cb: Callback) {
        self.out_buf.flip();
        let bytes = self.out_buf.bytes().to_vec();
        self.sent.extend_from_slice(&bytes);
        let n = self.out_buf.remaining();
        self.out_buf.advance(n);
        self.pending.push_back(cb);
    }

    fn send_partial(&mut self, cb: Callback) {
        self.send(cb);
    }

    fn send_chain(&mut self, cb: Callback, mut chain: BufChain) {
        chain.finish();
        for slice in chain.io_slices() {
            self.sent.extend_from_slice(&slice);
        }
        self.pending.push_back(cb);
    }

    fn send_buf(&mut self, cb: Callback, buf: ByteBuf) {
        self.sent.extend_from_slice(buf.bytes());
        self.pending.push_back(cb);
    }

    fn set_on_close(&mut self, cb: Callback) {
        self.on_close = Some(cb);
    }

    fn set_on_error(&mut self, cb: ErrorCallback) {
        self.on_error = Some(cb);
    }

    fn resume_recv(&mut self) {}

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.recv_cb = None;
        self.on_error = None;
        if let Some(mut cb) = self.on_close.take() {
            cb(self);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
