//! The record pump around a rustls server session.
//!
//! The session is driven sans-I/O: ciphertext moves between the net
//! buffers and the engine, cleartext between the engine and the app
//! buffers, and each step reports what has to happen next.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};

use crate::buf::{ByteBuf, NetBuf};
use crate::error::{Error, Result};

/// Space reserved for one outgoing record flight.
pub const RECORD_SPACE: usize = 18 * 1024;

/// What a wrap or unwrap step asks of its driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
    /// Nothing to do on this side.
    None,
    /// The destination buffer holds output that must drain first.
    DrainDest,
    /// The peer has closed the session; wrap close_notify and close.
    EngineClose,
    /// The engine has work that must run off the reactor thread.
    ScheduleTasks,
    /// The wrap side is blocked until more input is unwrapped.
    ScheduleUnwrap,
    /// The unwrap side produced something the wrap side must flush.
    ScheduleWrap,
    /// The session left the handshake.
    StateChange,
    /// More ciphertext is needed from the transport.
    UnwrapLoadSrc,
}

/// Appends records into a `NetBuf`'s writable space.
struct NetSink<'a>(&'a mut NetBuf);

impl<'a> Write for NetSink<'a> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.0.append(data);
        if n == 0 && !data.is_empty() {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "record space full"))
        } else {
            Ok(n)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Engine {
    session: ServerConnection,
    peer_closed: bool,
}

impl Engine {
    pub fn new(config: Arc<ServerConfig>) -> Result<Engine> {
        Ok(Engine {
            session: ServerConnection::new(config)?,
            peer_closed: false,
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    pub fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    pub fn wants_read(&self) -> bool {
        self.session.wants_read()
    }

    /// Queues close_notify for the next wrap.
    pub fn start_close(&mut self) {
        self.session.send_close_notify();
    }

    /// Hands cleartext to the engine for wrapping, returning how much it
    /// accepted.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<usize> {
        self.session.writer().write(bytes).map_err(Error::Io)
    }

    /// Runs the delegated handshake work: consumes a flight of ciphertext
    /// and advances the session. Reports `StateChange` when the handshake
    /// completed, `None` otherwise.
    pub fn run_delegated(&mut self, mut bytes: &[u8]) -> Result<Step> {
        let was_handshaking = self.session.is_handshaking();
        while !bytes.is_empty() {
            match self.session.read_tls(&mut bytes) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        let state = self.session.process_new_packets()?;
        if state.peer_has_closed() {
            self.peer_closed = true;
        }
        if was_handshaking && !self.session.is_handshaking() {
            Ok(Step::StateChange)
        } else {
            Ok(Step::None)
        }
    }

    /// One unwrap step: ciphertext in `src` becomes cleartext appended to
    /// `dest`.
    pub fn step_unwrap(&mut self, src: &mut NetBuf, dest: &mut ByteBuf) -> Result<Step> {
        if self.session.is_handshaking() {
            return Ok(if src.is_empty() {
                Step::UnwrapLoadSrc
            } else {
                Step::ScheduleTasks
            });
        }
        if !src.is_empty() {
            let mut cur = src.unread();
            let mut fed = 0;
            while !cur.is_empty() {
                match self.session.read_tls(&mut cur) {
                    Ok(0) => break,
                    Ok(n) => fed += n,
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            src.consume(fed);
        }
        let state = self.session.process_new_packets()?;
        if state.peer_has_closed() {
            self.peer_closed = true;
        }
        let mut produced = 0;
        let mut pending = state.plaintext_bytes_to_read();
        while pending > 0 && dest.has_remaining() {
            match self.session.reader().read(dest.space()) {
                Ok(0) => break,
                Ok(n) => {
                    dest.advance(n);
                    produced += n;
                    pending -= ::std::cmp::min(pending, n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        trace!("unwrap produced {} cleartext bytes, {} pending", produced, pending);
        if produced > 0 || pending > 0 {
            // pending > 0 means dest is full; the app has to drain it
            // before the engine gives up the rest
            return Ok(Step::DrainDest);
        }
        if self.peer_closed {
            return Ok(Step::EngineClose);
        }
        if self.session.wants_write() {
            return Ok(Step::ScheduleWrap);
        }
        Ok(Step::UnwrapLoadSrc)
    }

    /// One wrap step: cleartext remaining in `src` (ignored while
    /// handshaking) is fed to the engine and pending records are flushed
    /// into `dest`.
    pub fn step_wrap(&mut self, src: &mut ByteBuf, dest: &mut NetBuf) -> Result<Step> {
        if !self.session.is_handshaking() && src.has_remaining() {
            let n = self.feed(src.bytes())?;
            src.advance(n);
        }
        let mut wrote = 0;
        while self.session.wants_write() {
            if dest.space_len() == 0 {
                dest.ensure_space(RECORD_SPACE);
            }
            match self.session.write_tls(&mut NetSink(&mut *dest)) {
                Ok(0) => break,
                Ok(n) => wrote += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    dest.ensure_space(RECORD_SPACE);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        trace!("wrap flushed {} record bytes", wrote);
        if wrote > 0 || !dest.is_empty() {
            return Ok(Step::DrainDest);
        }
        if self.session.is_handshaking() && self.session.wants_read() {
            return Ok(Step::ScheduleUnwrap);
        }
        Ok(Step::None)
    }
}
