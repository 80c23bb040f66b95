//! HTTP Server
//!
//! A `Server` owns the reactor, a listening socket, and the URI to
//! handler registrations. Every accepted connection runs on the reactor
//! thread: raw or TLS transport, then the per-connection HTTP state
//! machine on top.
//!
//! ```no_run
//! use wick::buf::ByteBuf;
//! use wick::http::{Request, ResponseWriter};
//! use wick::server::Server;
//!
//! let mut server = Server::new().unwrap();
//! server.add_handler("/", |_req: &mut Request, _body: &mut ByteBuf, res: &mut ResponseWriter| {
//!     res.write_str("<html><body>Hello</body></html>");
//! });
//! server.listen_and_serve("127.0.0.1:3000").unwrap();
//! ```
//!
//! `Server::handle()` hands out a thread-safe [`Handle`] for stopping the
//! loop from outside.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::rc::Rc;

#[cfg(feature = "tls")]
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use crate::buf::{ByteBuf, Pool};
use crate::conn::{Connection, NbConn};
use crate::error::Result;
use crate::http::{Handler, HandlerMap, HttpConn};
use crate::reactor::{Handle, Reactor};
#[cfg(feature = "tls")]
use crate::tls;

const RESPONSE_POOL_CAP: usize = 64;
const RESPONSE_BUF_SIZE: usize = 4 * 1024;

enum Live {
    Raw(Rc<RefCell<NbConn>>),
    #[cfg(feature = "tls")]
    Tls {
        raw: Rc<RefCell<NbConn>>,
        #[allow(dead_code)]
        state: Rc<RefCell<tls::TlsState>>,
    },
}

type LiveSet = Rc<RefCell<HashMap<Token, Live>>>;

/// A single-threaded HTTP/1.1 server.
pub struct Server {
    reactor: Reactor,
    handlers: HandlerMap,
    conns: LiveSet,
    pool: Pool<ByteBuf>,
    addr: Option<SocketAddr>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl Server {
    pub fn new() -> Result<Server> {
        Ok(Server {
            reactor: Reactor::new()?,
            handlers: HashMap::new(),
            conns: Rc::new(RefCell::new(HashMap::new())),
            pool: Pool::new(RESPONSE_POOL_CAP, || {
                ByteBuf::with_capacity(RESPONSE_BUF_SIZE)
            }),
            addr: None,
            #[cfg(feature = "tls")]
            tls: None,
        })
    }

    /// Registers a handler for an exact URI. Registrations are fixed once
    /// the server starts listening.
    pub fn add_handler<H: Handler>(&mut self, uri: &str, handler: H) {
        self.handlers.insert(uri.to_owned(), Rc::new(handler));
    }

    /// Builds the TLS context from PEM certificate and key streams;
    /// accepted connections then speak TLS.
    #[cfg(feature = "tls")]
    pub fn configure_tls(
        &mut self,
        certs: &mut dyn io::BufRead,
        key: &mut dyn io::BufRead,
    ) -> Result<()> {
        self.tls = Some(tls::server_config(certs, key)?);
        Ok(())
    }

    /// A thread-safe handle for stopping the reactor.
    pub fn handle(&self) -> Handle {
        self.reactor.handle()
    }

    /// Flags the reactor to stop; safe from any thread via [`handle`].
    ///
    /// [`handle`]: Server::handle
    pub fn stop(&self) {
        self.reactor.handle().stop();
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Binds the listener and registers it for accept readiness.
    pub fn bind(&mut self, addr: &str) -> Result<SocketAddr> {
        let addr: SocketAddr = addr.parse().map_err(|e| {
            crate::Error::Io(io::Error::new(io::ErrorKind::InvalidInput, format!("{}", e)))
        })?;
        let mut listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        self.addr = Some(local);
        info!("listening on {}", local);

        let token = self.reactor.next_token();
        self.reactor
            .registry()?
            .register(&mut listener, token, Interest::READABLE)?;

        let conns = self.conns.clone();
        let handlers = Rc::new(mem::take(&mut self.handlers));
        let pool = self.pool.clone();
        let stopper = self.reactor.handle();
        #[cfg(feature = "tls")]
        let tls_config = self.tls.clone();

        self.reactor.insert_handler(token, move |reactor, _ready| {
            loop {
                let (stream, peer) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // a broken listener is fatal; per-connection
                        // failures never land here
                        error!("accept: {}", e);
                        stopper.stop();
                        return;
                    }
                };
                debug!("accepted {}", peer);
                #[cfg(feature = "tls")]
                let spawned = match tls_config {
                    Some(ref config) => {
                        spawn_tls(reactor, stream, config, &conns, &handlers, &pool)
                    }
                    None => spawn_raw(reactor, stream, &conns, &handlers, &pool),
                };
                #[cfg(not(feature = "tls"))]
                let spawned = spawn_raw(reactor, stream, &conns, &handlers, &pool);
                if let Err(e) = spawned {
                    warn!("connection setup failed: {}", e);
                }
            }
        });
        Ok(local)
    }

    /// Runs the reactor until stopped, then tears everything down.
    pub fn serve(&mut self) -> Result<()> {
        self.reactor.run()?;
        self.close();
        Ok(())
    }

    /// Binds and serves in one call.
    pub fn listen_and_serve(&mut self, addr: &str) -> Result<()> {
        self.bind(addr)?;
        self.serve()
    }

    /// Closes every live connection and the shared TLS workers.
    pub fn close(&mut self) {
        debug!("server closing");
        let live: Vec<Live> = {
            let mut conns = self.conns.borrow_mut();
            conns.drain().map(|(_, live)| live).collect()
        };
        for conn in live {
            match conn {
                Live::Raw(raw) => raw.borrow_mut().close(),
                #[cfg(feature = "tls")]
                Live::Tls { raw, .. } => raw.borrow_mut().close(),
            }
        }
        #[cfg(feature = "tls")]
        tls::tasks::shutdown();
    }
}

fn spawn_raw(
    reactor: &mut Reactor,
    stream: TcpStream,
    conns: &LiveSet,
    handlers: &Rc<HandlerMap>,
    pool: &Pool<ByteBuf>,
) -> Result<()> {
    let token = reactor.next_token();
    let conn = Rc::new(RefCell::new(NbConn::new(
        stream,
        token,
        reactor.registry()?,
        reactor.handle(),
    )));
    {
        let mut raw = conn.borrow_mut();
        install_cleanup(&mut *raw, conns, token);
        let http = HttpConn::shared(handlers.clone(), pool.clone());
        HttpConn::start(&http, &mut *raw);
    }
    let dispatch = conn.clone();
    reactor.insert_handler(token, move |_reactor, ready| {
        dispatch.borrow_mut().on_ready(ready);
    });
    conns.borrow_mut().insert(token, Live::Raw(conn));
    Ok(())
}

#[cfg(feature = "tls")]
fn spawn_tls(
    reactor: &mut Reactor,
    stream: TcpStream,
    config: &Arc<rustls::ServerConfig>,
    conns: &LiveSet,
    handlers: &Rc<HandlerMap>,
    pool: &Pool<ByteBuf>,
) -> Result<()> {
    let token = reactor.next_token();
    let conn = Rc::new(RefCell::new(NbConn::new(
        stream,
        token,
        reactor.registry()?,
        reactor.handle(),
    )));
    let state = tls::TlsState::shared(config.clone(), reactor.handle(), token)?;
    {
        let mut raw = conn.borrow_mut();
        tls::install(&state, &mut *raw);
        let http = HttpConn::shared(handlers.clone(), pool.clone());
        tls::with_io(&state, &mut *raw, |io| {
            install_cleanup(io, conns, token);
            HttpConn::start(&http, io);
        });
    }
    let dispatch = conn.clone();
    let dispatch_state = state.clone();
    reactor.insert_handler(token, move |_reactor, ready| {
        if ready.is_task() {
            tls::on_task(&dispatch_state, &mut *dispatch.borrow_mut());
        }
        if ready.is_readable() || ready.is_writable() {
            dispatch.borrow_mut().on_ready(ready);
        }
    });
    conns.borrow_mut().insert(token, Live::Tls { raw: conn, state });
    Ok(())
}

/// Close and error callbacks that drop the connection from the live set.
fn install_cleanup(conn: &mut dyn Connection, conns: &LiveSet, token: Token) {
    let on_close = conns.clone();
    conn.set_on_close(Box::new(move |conn| {
        trace!("{:?} left the live set", token);
        on_close.borrow_mut().remove(&token);
        if !conn.is_closed() {
            conn.close();
        }
    }));
    let on_error = conns.clone();
    conn.set_on_error(Box::new(move |conn, reason| {
        debug!("{:?} failed: {}", token, reason);
        on_error.borrow_mut().remove(&token);
        conn.close();
    }));
}
