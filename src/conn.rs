//! Non-blocking connections.
//!
//! A [`NbConn`] owns a socket plus an input and an output buffer, and the
//! application drives it entirely through callbacks: arm a receive, arm a
//! send, get called back when the readiness loop makes progress. The same
//! contract is implemented by the TLS overlay, so everything above the
//! transport is written against the [`Connection`] trait.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::buf::{BufChain, ByteBuf};
use crate::reactor::{Handle, Ready};

/// A callback invoked with the connection that fired it.
pub type Callback = Box<dyn FnMut(&mut dyn Connection)>;

/// An error callback; the reason is a short human-readable string. The
/// callback owns the decision to `close()`.
pub type ErrorCallback = Box<dyn FnMut(&mut dyn Connection, &str)>;

/// The callback contract shared by raw and TLS connections.
///
/// Receive delivery hands over the input buffer flipped to read mode;
/// the callback must leave it compacted (or cleared) for appending before
/// returning. Send completion callbacks never fire on failure.
pub trait Connection {
    /// The input buffer; cleartext for TLS connections.
    fn in_buf(&mut self) -> &mut ByteBuf;

    /// The output buffer; cleartext for TLS connections.
    fn out_buf(&mut self) -> &mut ByteBuf;

    /// Arms a one-shot receive. Calling again replaces the callback
    /// without touching the selector registration.
    fn recv(&mut self, cb: Callback);

    /// Arms a receive that stays armed across deliveries.
    fn recv_persistent(&mut self, cb: Callback);

    /// Clears the receive callback and drops read interest.
    fn cancel_recv(&mut self);

    /// Sends the output buffer; the callback fires once it is drained.
    /// The buffer is read as-is and left drained in place; clear it
    /// before filling it again.
    fn send(&mut self, cb: Callback);

    /// Sends the output buffer, reporting progress: the callback fires
    /// after any non-zero write that leaves bytes behind, or on drain, and
    /// write interest is cancelled either way. Call again to continue.
    fn send_partial(&mut self, cb: Callback);

    /// Scatter-sends a buffer chain; the callback fires on full drain.
    fn send_chain(&mut self, cb: Callback, chain: BufChain);

    /// Sends a single external buffer; the callback fires on full drain.
    fn send_buf(&mut self, cb: Callback, buf: ByteBuf);

    fn set_on_close(&mut self, cb: Callback);

    fn set_on_error(&mut self, cb: ErrorCallback);

    /// Re-arms delivery after the application stopped consuming, so bytes
    /// parked in the transport are picked up again.
    fn resume_recv(&mut self);

    /// Closes the connection; no further callbacks fire afterwards, other
    /// than the close callback if it has not run yet.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

enum SendSource {
    /// Draining `out_buf`.
    Out,
    /// Draining one external buffer.
    Single(ByteBuf),
    /// Draining a scatter chain.
    Chain(BufChain),
}

/// A raw non-blocking TCP connection.
pub struct NbConn {
    stream: TcpStream,
    token: Token,
    registry: Registry,
    handle: Handle,
    in_buf: ByteBuf,
    out_buf: ByteBuf,
    recv_cb: Option<Callback>,
    recv_persistent: bool,
    send_cb: Option<Callback>,
    send_source: SendSource,
    send_report_partial: bool,
    draining: bool,
    on_close: Option<Callback>,
    on_error: Option<ErrorCallback>,
    want_read: bool,
    want_write: bool,
    registered: bool,
    applied: Option<(bool, bool)>,
    closed: bool,
}

const DEFAULT_BUF_SIZE: usize = 8 * 1024;

impl NbConn {
    pub fn new(stream: TcpStream, token: Token, registry: Registry, handle: Handle) -> NbConn {
        NbConn::with_buffers(stream, token, registry, handle, DEFAULT_BUF_SIZE, DEFAULT_BUF_SIZE)
    }

    /// Starts a non-blocking connect, for using a connection client-side.
    pub fn connect(
        addr: SocketAddr,
        token: Token,
        registry: Registry,
        handle: Handle,
    ) -> io::Result<NbConn> {
        let stream = TcpStream::connect(addr)?;
        Ok(NbConn::new(stream, token, registry, handle))
    }

    /// `connect` with explicit buffer capacities.
    pub fn connect_with_buffers(
        addr: SocketAddr,
        token: Token,
        registry: Registry,
        handle: Handle,
        in_cap: usize,
        out_cap: usize,
    ) -> io::Result<NbConn> {
        let stream = TcpStream::connect(addr)?;
        Ok(NbConn::with_buffers(stream, token, registry, handle, in_cap, out_cap))
    }

    pub fn with_buffers(
        stream: TcpStream,
        token: Token,
        registry: Registry,
        handle: Handle,
        in_cap: usize,
        out_cap: usize,
    ) -> NbConn {
        NbConn {
            stream,
            token,
            registry,
            handle,
            in_buf: ByteBuf::with_capacity(in_cap),
            out_buf: ByteBuf::with_capacity(out_cap),
            recv_cb: None,
            recv_persistent: false,
            send_cb: None,
            send_source: SendSource::Out,
            send_report_partial: false,
            draining: false,
            on_close: None,
            on_error: None,
            want_read: false,
            want_write: false,
            registered: false,
            applied: None,
            closed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Reacts to a readiness notice for this connection's token.
    pub fn on_ready(&mut self, ready: Ready) {
        if self.closed {
            return;
        }
        if ready.is_readable() {
            self.on_readable();
        }
        if !self.closed && ready.is_writable() {
            self.on_writable();
        }
    }

    fn on_readable(&mut self) {
        trace!("{:?} readable", self.token);
        loop {
            // interest may have been cancelled by an earlier callback in
            // this same pass; a stale ready bit must not re-invoke it
            if self.closed || !self.want_read || self.recv_cb.is_none() {
                return;
            }
            let mut eof = false;
            let mut blocked = false;
            let mut got = 0;
            while self.in_buf.has_remaining() {
                match self.stream.read(self.in_buf.space()) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        got += n;
                        self.in_buf.advance(n);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        blocked = true;
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let reason = format!("read: {}", e);
                        self.fail(&reason);
                        return;
                    }
                }
            }
            trace!("{:?} read {} bytes (eof={})", self.token, got, eof);
            if got > 0 {
                self.deliver_recv();
            }
            if self.closed {
                return;
            }
            if eof {
                self.deliver_close();
                return;
            }
            if blocked || got == 0 {
                return;
            }
        }
    }

    fn deliver_recv(&mut self) {
        let mut cb = match self.recv_cb.take() {
            Some(cb) => cb,
            None => return,
        };
        if !self.recv_persistent {
            self.want_read = false;
            self.sync_interest();
        }
        self.in_buf.flip();
        cb(self);
        // restore unless the callback re-armed, cancelled, or closed
        if self.recv_persistent && self.want_read && self.recv_cb.is_none() && !self.closed {
            self.recv_cb = Some(cb);
        }
    }

    fn deliver_close(&mut self) {
        debug!("{:?} peer closed", self.token);
        self.want_read = false;
        self.recv_cb = None;
        if let Some(mut cb) = self.on_close.take() {
            cb(self);
        } else {
            self.close();
        }
    }

    fn on_writable(&mut self) {
        trace!("{:?} writable", self.token);
        loop {
            if self.closed || !self.want_write || self.send_cb.is_none() {
                return;
            }
            let n = match self.write_step() {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let reason = format!("write: {}", e);
                    self.fail(&reason);
                    return;
                }
            };
            let left = self.send_remaining();
            trace!("{:?} wrote {} bytes, {} left", self.token, n, left);
            if left == 0 {
                self.finish_send();
                return;
            }
            if n > 0 && self.send_report_partial {
                // report progress, drop write interest; the application
                // re-arms when it wants to continue
                self.want_write = false;
                self.sync_interest();
                if let Some(mut cb) = self.send_cb.take() {
                    cb(self);
                }
                return;
            }
            if n == 0 {
                return;
            }
        }
    }

    fn write_step(&mut self) -> io::Result<usize> {
        match self.send_source {
            SendSource::Out => {
                let n = self.stream.write(self.out_buf.bytes())?;
                self.out_buf.advance(n);
                Ok(n)
            }
            SendSource::Single(ref mut buf) => {
                let n = self.stream.write(buf.bytes())?;
                buf.advance(n);
                Ok(n)
            }
            SendSource::Chain(ref mut chain) => {
                let n = {
                    let slices = chain.io_slices();
                    self.stream.write_vectored(&slices)?
                };
                chain.advance(n);
                Ok(n)
            }
        }
    }

    fn send_remaining(&self) -> usize {
        match self.send_source {
            SendSource::Out => self.out_buf.remaining(),
            SendSource::Single(ref buf) => buf.remaining(),
            SendSource::Chain(ref chain) => chain.remaining(),
        }
    }

    fn finish_send(&mut self) {
        // drop the drained source before the callback so pooled buffers
        // are already back on their free list; out_buf stays drained in
        // place (remaining() == 0) until the app clears it for reuse
        let _ = ::std::mem::replace(&mut self.send_source, SendSource::Out);
        self.draining = false;
        self.want_write = false;
        self.sync_interest();
        if let Some(mut cb) = self.send_cb.take() {
            cb(self);
        }
    }

    fn arm_send(&mut self, cb: Callback, source: SendSource, partial: bool) {
        if self.closed {
            return;
        }
        self.send_cb = Some(cb);
        self.send_report_partial = partial;
        match source {
            SendSource::Out => {
                // flip once; a partial-send re-arm keeps draining as-is
                if !self.draining {
                    self.out_buf.flip();
                    self.draining = true;
                }
            }
            other => {
                self.send_source = other;
                self.draining = true;
            }
        }
        self.want_write = true;
        self.sync_interest();
    }

    fn fail(&mut self, reason: &str) {
        warn!("{:?} {}", self.token, reason);
        if let Some(mut cb) = self.on_error.take() {
            cb(self, reason);
        } else {
            self.close();
        }
    }

    fn sync_interest(&mut self) {
        if self.closed {
            return;
        }
        let want = (self.want_read, self.want_write);
        if self.applied == Some(want) {
            return;
        }
        let interest = match want {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        let res = match interest {
            Some(interest) if self.registered => {
                self.registry.reregister(&mut self.stream, self.token, interest)
            }
            Some(interest) => {
                self.registered = true;
                self.registry.register(&mut self.stream, self.token, interest)
            }
            None if self.registered => {
                self.registered = false;
                self.applied = None;
                let _ = self.registry.deregister(&mut self.stream);
                return;
            }
            None => return,
        };
        match res {
            Ok(()) => self.applied = Some(want),
            Err(e) => {
                let reason = format!("selector: {}", e);
                self.fail(&reason);
            }
        }
    }
}

impl Connection for NbConn {
    fn in_buf(&mut self) -> &mut ByteBuf {
        &mut self.in_buf
    }

    fn out_buf(&mut self) -> &mut ByteBuf {
        &mut self.out_buf
    }

    fn recv(&mut self, cb: Callback) {
        if self.closed {
            return;
        }
        self.recv_cb = Some(cb);
        self.recv_persistent = false;
        self.want_read = true;
        self.sync_interest();
    }

    fn recv_persistent(&mut self, cb: Callback) {
        if self.closed {
            return;
        }
        self.recv_cb = Some(cb);
        self.recv_persistent = true;
        self.want_read = true;
        self.sync_interest();
    }

    fn cancel_recv(&mut self) {
        self.recv_cb = None;
        self.recv_persistent = false;
        self.want_read = false;
        self.sync_interest();
    }

    fn send(&mut self, cb: Callback) {
        self.arm_send(cb, SendSource::Out, false);
    }

    fn send_partial(&mut self, cb: Callback) {
        self.arm_send(cb, SendSource::Out, true);
    }

    fn send_chain(&mut self, cb: Callback, mut chain: BufChain) {
        chain.finish();
        self.arm_send(cb, SendSource::Chain(chain), false);
    }

    fn send_buf(&mut self, cb: Callback, buf: ByteBuf) {
        self.arm_send(cb, SendSource::Single(buf), false);
    }

    fn set_on_close(&mut self, cb: Callback) {
        self.on_close = Some(cb);
    }

    fn set_on_error(&mut self, cb: ErrorCallback) {
        self.on_error = Some(cb);
    }

    fn resume_recv(&mut self) {
        if self.closed || !self.want_read || !self.registered {
            return;
        }
        // force a reregistration so an edge-triggered selector re-delivers
        // readiness for bytes that arrived while delivery was parked
        self.applied = None;
        self.sync_interest();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!("{:?} close", self.token);
        self.closed = true;
        self.recv_cb = None;
        self.send_cb = None;
        self.on_error = None;
        self.want_read = false;
        self.want_write = false;
        if self.registered {
            self.registered = false;
            let _ = self.registry.deregister(&mut self.stream);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        let token = self.token;
        self.handle.post(move |reactor| reactor.remove_handler(token));
        if let Some(mut cb) = self.on_close.take() {
            cb(self);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
