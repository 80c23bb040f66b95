//! The TLS overlay.
//!
//! A TLS connection interposes between a raw [`NbConn`](crate::conn::NbConn)
//! and the application, presenting the same [`Connection`] contract while
//! pumping records through a rustls engine. Four buffers sit around the
//! engine: `net_in`/`net_out` carry ciphertext between the socket and the
//! engine, `app_in`/`app_out` carry cleartext between the engine and the
//! application.
//!
//! Handshake record processing is the delegated work: the engine value and
//! the pending ciphertext move to the shared worker pool, and completion
//! re-enters the reactor as a posted task. At most one wrap chain and one
//! unwrap chain are in flight per connection, and a completion never
//! touches connection state directly.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use mio::Token;
use rustls::ServerConfig;

use crate::buf::{BufChain, ByteBuf, NetBuf};
use crate::conn::{Callback, Connection, ErrorCallback};
use crate::error::{Error, Result};
use crate::reactor::{Handle, Ready};

pub use self::state::{Engine, Step};

mod state;
pub mod tasks;

const APP_BUF_SIZE: usize = 16 * 1024;
const NET_BUF_SIZE: usize = state::RECORD_SPACE;

/// Builds a server config from PEM certificate and private-key streams.
pub fn server_config(
    certs: &mut dyn io::BufRead,
    key: &mut dyn io::BufRead,
) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(certs).collect::<io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(key)?.ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no private key in stream",
        ))
    })?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Hs {
    NeedUnwrap,
    NeedWrap,
    NeedTask,
    Done,
}

enum AppSource {
    /// Draining `app_out`.
    Out,
    /// Draining one external buffer.
    Single(ByteBuf),
    /// Draining a scatter chain.
    Chain(BufChain),
}

struct TaskDone {
    engine: Engine,
    result: Result<Step>,
}

/// Per-connection TLS state, shared between the raw connection's
/// callbacks and the reactor's task dispatch.
pub struct TlsState {
    engine: Option<Engine>,
    net_in: NetBuf,
    net_out: NetBuf,
    app_in: ByteBuf,
    app_out: ByteBuf,
    scratch: ByteBuf,
    hs: Hs,
    recv_cb: Option<Callback>,
    recv_persistent: bool,
    recv_armed: bool,
    parked: bool,
    send_cb: Option<Callback>,
    send_source: Option<AppSource>,
    send_report_partial: bool,
    send_total: usize,
    app_draining: bool,
    on_close: Option<Callback>,
    on_error: Option<ErrorCallback>,
    net_send_in_flight: bool,
    task_in_flight: bool,
    task_slot: Arc<Mutex<Option<TaskDone>>>,
    want_shutdown: bool,
    close_notify_sent: bool,
    closed: bool,
    handle: Handle,
    token: Token,
}

impl TlsState {
    /// Creates the shared state with a fresh engine for one accepted
    /// connection.
    pub fn shared(
        config: Arc<ServerConfig>,
        handle: Handle,
        token: Token,
    ) -> Result<Rc<RefCell<TlsState>>> {
        Ok(Rc::new(RefCell::new(TlsState {
            engine: Some(Engine::new(config)?),
            net_in: NetBuf::with_capacity(NET_BUF_SIZE),
            net_out: NetBuf::with_capacity(NET_BUF_SIZE),
            app_in: ByteBuf::with_capacity(APP_BUF_SIZE),
            app_out: ByteBuf::with_capacity(APP_BUF_SIZE),
            scratch: ByteBuf::with_capacity(0),
            hs: Hs::NeedUnwrap,
            recv_cb: None,
            recv_persistent: false,
            recv_armed: false,
            parked: false,
            send_cb: None,
            send_source: None,
            send_report_partial: false,
            send_total: 0,
            app_draining: false,
            on_close: None,
            on_error: None,
            net_send_in_flight: false,
            task_in_flight: false,
            task_slot: Arc::new(Mutex::new(None)),
            want_shutdown: false,
            close_notify_sent: false,
            closed: false,
            handle,
            token,
        })))
    }

    fn schedule_pump(&self) {
        let token = self.token;
        self.handle.post(move |reactor| reactor.notify(token, Ready::task()));
    }
}

/// Hooks the TLS pump onto the raw connection's callbacks. The server
/// then arms the application side through [`with_io`].
pub fn install(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection) {
    let on_close = rc.clone();
    raw.set_on_close(Box::new(move |raw| on_net_closed(&on_close, raw)));
    let on_error = rc.clone();
    raw.set_on_error(Box::new(move |raw, reason| {
        let reason = format!("transport: {}", reason);
        fail(&on_error, raw, &reason);
    }));
    let on_recv = rc.clone();
    raw.recv_persistent(Box::new(move |raw| on_net_recv(&on_recv, raw)));
}

/// Runs `f` with the TLS face of the connection, the same view pump-driven
/// callbacks receive.
pub fn with_io<F>(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection, f: F)
where
    F: FnOnce(&mut dyn Connection),
{
    let mut st = rc.borrow_mut();
    let mut io = TlsIo {
        rc: rc.clone(),
        st: &mut *st,
        raw,
    };
    f(&mut io);
}

/// Handles a task notice for this connection: either a delegated-work
/// completion or a request to run the pump.
pub fn on_task(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection) {
    let mut failure = None;
    {
        let mut st = rc.borrow_mut();
        let done = st.task_slot.lock().unwrap().take();
        if let Some(done) = done {
            st.task_in_flight = false;
            st.engine = Some(done.engine);
            match done.result {
                Ok(Step::StateChange) => {
                    trace!("{:?} delegated work finished the handshake", st.token)
                }
                Ok(_) => {}
                Err(e) => failure = Some(format!("handshake: {}", e)),
            }
        }
    }
    if let Some(reason) = failure {
        fail(rc, raw, &reason);
        return;
    }
    pump(rc, raw);
}

enum Action {
    Done,
    DeliverRecv,
    CompleteSend,
    PartialSend,
    CloseRaw,
    Fail(String),
}

/// Drives the connection as far as it will go without new events.
fn pump(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection) {
    loop {
        let action = {
            let mut st = rc.borrow_mut();
            step(rc, &mut st, raw)
        };
        match action {
            Action::Done => return,
            Action::DeliverRecv => deliver_recv(rc, raw),
            Action::CompleteSend => complete_send(rc, raw, false),
            Action::PartialSend => complete_send(rc, raw, true),
            Action::CloseRaw => {
                shutdown_raw(rc, raw);
                return;
            }
            Action::Fail(reason) => {
                fail(rc, raw, &reason);
                return;
            }
        }
    }
}

fn step(rc: &Rc<RefCell<TlsState>>, st: &mut TlsState, raw: &mut dyn Connection) -> Action {
    if st.closed || st.task_in_flight {
        return Action::Done;
    }
    let engine = match st.engine.as_mut() {
        Some(engine) => engine,
        None => return Action::Done,
    };

    if engine.is_handshaking() {
        if st.want_shutdown {
            return Action::CloseRaw;
        }
        if !st.net_in.is_empty() {
            st.hs = Hs::NeedTask;
            delegate(st);
            return Action::Done;
        }
        if engine.wants_write() {
            st.hs = Hs::NeedWrap;
            return match engine.step_wrap(&mut st.scratch, &mut st.net_out) {
                Ok(Step::DrainDest) => {
                    flush_net(rc, st, raw);
                    Action::Done
                }
                Ok(_) => Action::Done,
                Err(e) => Action::Fail(format!("handshake wrap: {}", e)),
            };
        }
        // waiting on ciphertext; the persistent raw recv feeds net_in
        st.hs = Hs::NeedUnwrap;
        return Action::Done;
    }

    if st.hs != Hs::Done {
        debug!("{:?} tls handshake complete", st.token);
        st.hs = Hs::Done;
    }

    // cleartext already unwrapped and waiting beats everything else
    if !st.parked && st.recv_armed && st.recv_cb.is_some() && st.app_in.position() > 0 {
        return Action::DeliverRecv;
    }

    if st.want_shutdown && !st.close_notify_sent {
        engine.start_close();
        st.close_notify_sent = true;
    }

    // feed an external send source; app_out flows through step_wrap below
    if st.send_cb.is_some() && !st.want_shutdown {
        if let Err(e) = feed_source(engine, &mut st.send_source) {
            return Action::Fail(format!("wrap: {}", e));
        }
    }

    let filled_before = st.app_in.position();
    match engine.step_unwrap(&mut st.net_in, &mut st.app_in) {
        Ok(Step::DrainDest) => {
            if st.app_in.position() > filled_before {
                st.parked = false;
            }
            if !st.parked
                && st.recv_armed
                && st.recv_cb.is_some()
                && st.app_in.position() > 0
            {
                return Action::DeliverRecv;
            }
        }
        Ok(Step::EngineClose) => {
            debug!("{:?} peer closed tls session", st.token);
            st.want_shutdown = true;
            if !st.close_notify_sent {
                engine.start_close();
                st.close_notify_sent = true;
            }
        }
        Ok(_) => {}
        Err(e) => return Action::Fail(format!("unwrap: {}", e)),
    }

    // flush records; only the armed Out source feeds cleartext here
    let wrap_app_out = st.send_cb.is_some()
        && !st.want_shutdown
        && matches!(st.send_source, Some(AppSource::Out));
    let wrapped = if wrap_app_out {
        engine.step_wrap(&mut st.app_out, &mut st.net_out)
    } else {
        engine.step_wrap(&mut st.scratch, &mut st.net_out)
    };
    match wrapped {
        Ok(Step::DrainDest) => flush_net(rc, st, raw),
        Ok(_) => {}
        Err(e) => return Action::Fail(format!("wrap: {}", e)),
    }

    let wants_write = st.engine.as_ref().map(Engine::wants_write).unwrap_or(false);
    let flushed = !wants_write && st.net_out.is_empty() && !st.net_send_in_flight;

    if st.send_cb.is_some() {
        let remaining = source_remaining(st);
        if remaining == 0 && flushed {
            return Action::CompleteSend;
        }
        if st.send_report_partial && remaining > 0 && remaining < st.send_total {
            return Action::PartialSend;
        }
    }

    if st.want_shutdown && st.close_notify_sent && flushed {
        return Action::CloseRaw;
    }

    Action::Done
}

fn feed_source(engine: &mut Engine, source: &mut Option<AppSource>) -> Result<()> {
    match *source {
        Some(AppSource::Single(ref mut buf)) => {
            if buf.has_remaining() {
                let n = engine.feed(buf.bytes())?;
                buf.advance(n);
            }
        }
        Some(AppSource::Chain(ref mut chain)) => loop {
            let fed = {
                let slices = chain.io_slices();
                match slices.first() {
                    Some(slice) => engine.feed(slice)?,
                    None => break,
                }
            };
            if fed == 0 {
                break;
            }
            chain.advance(fed);
        },
        Some(AppSource::Out) | None => {}
    }
    Ok(())
}

fn source_remaining(st: &TlsState) -> usize {
    match st.send_source {
        Some(AppSource::Out) => st.app_out.remaining(),
        Some(AppSource::Single(ref buf)) => buf.remaining(),
        Some(AppSource::Chain(ref chain)) => chain.remaining(),
        None => 0,
    }
}

/// Moves pending records into the raw connection's output buffer and arms
/// a send, one in flight at a time.
fn flush_net(rc: &Rc<RefCell<TlsState>>, st: &mut TlsState, raw: &mut dyn Connection) {
    if st.net_send_in_flight || st.net_out.is_empty() {
        return;
    }
    // the previous flush fully drained; reopen the buffer for appending
    raw.out_buf().clear();
    let n = raw.out_buf().put_slice(st.net_out.unread());
    st.net_out.consume(n);
    st.net_send_in_flight = true;
    trace!("{:?} flushing {} record bytes", st.token, n);
    let rc = rc.clone();
    raw.send(Box::new(move |raw| on_net_sent(&rc, raw)));
}

fn on_net_sent(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection) {
    {
        let mut st = rc.borrow_mut();
        st.net_send_in_flight = false;
    }
    pump(rc, raw);
}

fn on_net_recv(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection) {
    {
        let mut st = rc.borrow_mut();
        let len = raw.in_buf().remaining();
        st.net_in.ensure_space(len);
        let n = st.net_in.append(raw.in_buf().bytes());
        debug_assert_eq!(n, len);
        raw.in_buf().advance(n);
        raw.in_buf().clear();
    }
    pump(rc, raw);
}

fn on_net_closed(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection) {
    let cb = {
        let mut st = rc.borrow_mut();
        st.closed = true;
        st.recv_cb = None;
        st.send_cb = None;
        st.on_error = None;
        st.on_close.take()
    };
    if !raw.is_closed() {
        raw.close();
    }
    if let Some(mut cb) = cb {
        let mut st = rc.borrow_mut();
        let mut io = TlsIo {
            rc: rc.clone(),
            st: &mut *st,
            raw,
        };
        cb(&mut io);
    }
}

fn fail(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection, reason: &str) {
    let cb = {
        let mut st = rc.borrow_mut();
        warn!("{:?} tls {}", st.token, reason);
        st.recv_cb = None;
        st.send_cb = None;
        st.on_error.take()
    };
    match cb {
        Some(mut cb) => {
            let mut st = rc.borrow_mut();
            let mut io = TlsIo {
                rc: rc.clone(),
                st: &mut *st,
                raw,
            };
            cb(&mut io, reason);
        }
        None => on_net_closed(rc, raw),
    }
}

fn delegate(st: &mut TlsState) {
    let engine = match st.engine.take() {
        Some(engine) => engine,
        None => return,
    };
    let bytes = st.net_in.drain();
    st.task_in_flight = true;
    trace!("{:?} delegating {} handshake bytes", st.token, bytes.len());
    let slot = st.task_slot.clone();
    let handle = st.handle.clone();
    let token = st.token;
    tasks::execute(Box::new(move || {
        let mut engine = engine;
        let result = engine.run_delegated(&bytes);
        *slot.lock().unwrap() = Some(TaskDone { engine, result });
        handle.post(move |reactor| reactor.notify(token, Ready::task()));
    }));
}

fn deliver_recv(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection) {
    let (mut cb, persistent, delivered) = {
        let mut st = rc.borrow_mut();
        let cb = match st.recv_cb.take() {
            Some(cb) => cb,
            None => return,
        };
        let persistent = st.recv_persistent;
        if !persistent {
            st.recv_armed = false;
        }
        let delivered = st.app_in.position();
        st.app_in.flip();
        (cb, persistent, delivered)
    };
    {
        let mut st = rc.borrow_mut();
        let mut io = TlsIo {
            rc: rc.clone(),
            st: &mut *st,
            raw,
        };
        cb(&mut io);
    }
    let mut st = rc.borrow_mut();
    if delivered > 0 && st.app_in.position() >= delivered {
        // nothing consumed; park delivery until the app resumes
        st.parked = true;
    }
    if persistent && st.recv_armed && st.recv_cb.is_none() && !st.closed {
        st.recv_cb = Some(cb);
    }
}

fn complete_send(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection, partial: bool) {
    let cb = {
        let mut st = rc.borrow_mut();
        let cb = st.send_cb.take();
        if !partial {
            match st.send_source.take() {
                Some(AppSource::Out) | None => st.app_out.clear(),
                Some(_) => {}
            }
            st.app_draining = false;
            st.send_total = 0;
        }
        cb
    };
    if let Some(mut cb) = cb {
        let mut st = rc.borrow_mut();
        let mut io = TlsIo {
            rc: rc.clone(),
            st: &mut *st,
            raw,
        };
        cb(&mut io);
    }
}

fn shutdown_raw(rc: &Rc<RefCell<TlsState>>, raw: &mut dyn Connection) {
    {
        let mut st = rc.borrow_mut();
        debug!("{:?} tls close", st.token);
        st.closed = true;
    }
    if !raw.is_closed() {
        raw.close();
    } else {
        on_net_closed(rc, raw);
    }
}

/// The application's view of a TLS connection, valid for the duration of
/// one callback.
struct TlsIo<'a> {
    rc: Rc<RefCell<TlsState>>,
    st: &'a mut TlsState,
    raw: &'a mut dyn Connection,
}

impl<'a> TlsIo<'a> {
    fn arm_send(&mut self, cb: Callback, source: AppSource, partial: bool) {
        if self.st.closed {
            return;
        }
        if let AppSource::Out = source {
            if !self.st.app_draining {
                self.st.app_out.flip();
                self.st.app_draining = true;
            }
        }
        self.st.send_cb = Some(cb);
        self.st.send_source = Some(source);
        self.st.send_report_partial = partial;
        self.st.send_total = source_remaining(self.st);
        self.st.schedule_pump();
    }
}

impl<'a> Connection for TlsIo<'a> {
    fn in_buf(&mut self) -> &mut ByteBuf {
        &mut self.st.app_in
    }

    fn out_buf(&mut self) -> &mut ByteBuf {
        &mut self.st.app_out
    }

    fn recv(&mut self, cb: Callback) {
        if self.st.closed {
            return;
        }
        self.st.recv_cb = Some(cb);
        self.st.recv_persistent = false;
        self.st.recv_armed = true;
        self.st.parked = false;
        self.st.schedule_pump();
    }

    fn recv_persistent(&mut self, cb: Callback) {
        if self.st.closed {
            return;
        }
        self.st.recv_cb = Some(cb);
        self.st.recv_persistent = true;
        self.st.recv_armed = true;
        self.st.parked = false;
        self.st.schedule_pump();
    }

    fn cancel_recv(&mut self) {
        self.st.recv_cb = None;
        self.st.recv_persistent = false;
        self.st.recv_armed = false;
    }

    fn send(&mut self, cb: Callback) {
        self.arm_send(cb, AppSource::Out, false);
    }

    fn send_partial(&mut self, cb: Callback) {
        self.arm_send(cb, AppSource::Out, true);
    }

    fn send_chain(&mut self, cb: Callback, mut chain: BufChain) {
        chain.finish();
        self.arm_send(cb, AppSource::Chain(chain), false);
    }

    fn send_buf(&mut self, cb: Callback, buf: ByteBuf) {
        self.arm_send(cb, AppSource::Single(buf), false);
    }

    fn set_on_close(&mut self, cb: Callback) {
        self.st.on_close = Some(cb);
    }

    fn set_on_error(&mut self, cb: ErrorCallback) {
        self.st.on_error = Some(cb);
    }

    fn resume_recv(&mut self) {
        if self.st.closed {
            return;
        }
        self.st.parked = false;
        self.raw.resume_recv();
        self.st.schedule_pump();
    }

    fn close(&mut self) {
        if self.st.closed || self.st.want_shutdown {
            return;
        }
        self.st.want_shutdown = true;
        self.st.schedule_pump();
    }

    fn is_closed(&self) -> bool {
        self.st.closed
    }
}
