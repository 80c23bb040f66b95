//! The per-connection HTTP/1.1 state machine.
//!
//! Each connection steps through `RequestStart -> RequestHeaders ->
//! MessageBody`, dispatches to the registered handler, and returns to
//! `RequestStart` once the response drains, so pipelined requests flow
//! back to back. State handlers parse what the input buffer holds and
//! report whether their phase completed; an incomplete phase leaves the
//! remainder compacted and waits for the next delivery.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::buf::{ByteBuf, Pool};
use crate::conn::Connection;
use crate::method::Method;
use crate::status::StatusCode;
use crate::version::Version;

pub use self::headers::Headers;
pub use self::parse::InvalidRequest;
pub use self::request::{BodyCallback, BodyKind, Request};
pub use self::response::ResponseWriter;

pub mod headers;
pub mod parse;
pub mod request;
pub mod response;

/// Composes the response for one request.
pub trait Handler: 'static {
    /// `body` is empty for GET and HEAD; for any other method it holds
    /// the raw input remainder as a single chunk, with no transfer
    /// framing interpreted.
    fn handle(&self, req: &mut Request, body: &mut ByteBuf, res: &mut ResponseWriter);
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut ByteBuf, &mut ResponseWriter) + 'static,
{
    fn handle(&self, req: &mut Request, body: &mut ByteBuf, res: &mut ResponseWriter) {
        self(req, body, res)
    }
}

/// URI to handler registrations, shared across connections.
pub type HandlerMap = HashMap<String, Rc<dyn Handler>>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    RequestStart,
    RequestHeaders,
    MessageBody,
    ServerError,
}

/// Parser scratch and dispatch state for one connection.
pub struct HttpConn {
    state: State,
    request: Request,
    last_header: Option<String>,
    handlers: Rc<HandlerMap>,
    pool: Pool<ByteBuf>,
    sending: bool,
    self_ref: Weak<RefCell<HttpConn>>,
}

impl HttpConn {
    pub fn shared(handlers: Rc<HandlerMap>, pool: Pool<ByteBuf>) -> Rc<RefCell<HttpConn>> {
        let rc = Rc::new(RefCell::new(HttpConn {
            state: State::RequestStart,
            request: Request::new(),
            last_header: None,
            handlers,
            pool,
            sending: false,
            self_ref: Weak::new(),
        }));
        rc.borrow_mut().self_ref = Rc::downgrade(&rc);
        rc
    }

    /// Arms the machine: a persistent recv feeds the parser for the life
    /// of the connection.
    pub fn start(rc: &Rc<RefCell<HttpConn>>, conn: &mut dyn Connection) {
        let me = rc.clone();
        conn.recv_persistent(Box::new(move |conn| me.borrow_mut().on_recv(conn)));
    }

    fn on_recv(&mut self, conn: &mut dyn Connection) {
        loop {
            if self.sending {
                // a response is in flight; let pipelined bytes pile up
                conn.in_buf().compact();
                return;
            }
            let stepped = match self.state {
                State::RequestStart => self.on_request_start(conn.in_buf()),
                State::RequestHeaders => self.on_request_headers(conn.in_buf()),
                State::MessageBody => self.on_message_body(conn),
                State::ServerError => {
                    self.emit_error(conn, StatusCode::INTERNAL_SERVER_ERROR);
                    return;
                }
            };
            match stepped {
                Ok(true) => {}
                Ok(false) => return,
                Err(invalid) => {
                    trace!("request rejected: {:?}", invalid);
                    self.state = State::ServerError;
                    self.emit_error(conn, StatusCode(invalid.status));
                    return;
                }
            }
        }
    }

    /// `METHOD SP URI SP HTTP/1.x CRLF`; empty lines before the request
    /// line are ignored.
    fn on_request_start(&mut self, buf: &mut ByteBuf) -> Result<bool, InvalidRequest> {
        let line = match parse::parse_line(buf)? {
            Some(line) => line,
            None => return Ok(false),
        };
        if line.is_empty() {
            return Ok(true);
        }
        let (method, uri, version) = parse::parse_request_line(&line)?;
        trace!("request line: {} {} {}", method, uri, version);
        self.request.clear();
        self.request.set_start(method, uri, version);
        self.last_header = None;
        self.state = State::RequestHeaders;
        Ok(true)
    }

    /// Header lines up to the bare CRLF; leading whitespace folds a line
    /// onto the previous header's value.
    fn on_request_headers(&mut self, buf: &mut ByteBuf) -> Result<bool, InvalidRequest> {
        loop {
            let line = match parse::parse_line(buf)? {
                Some(line) => line,
                None => return Ok(false),
            };
            if line.is_empty() {
                self.last_header = None;
                self.state = State::MessageBody;
                return Ok(true);
            }
            if line[0] == b' ' || line[0] == b'\t' {
                let name = self
                    .last_header
                    .as_ref()
                    .ok_or_else(|| InvalidRequest::new(400))?;
                let folded = parse::trim_value(&line)?;
                if !self.request.headers_mut().append_value(name, &folded) {
                    return Err(InvalidRequest::new(400));
                }
            } else {
                let (name, value) = parse::parse_header(&line)?;
                self.request.headers_mut().add(&name, &value);
                self.last_header = Some(Headers::canonicalize(&name));
            }
        }
    }

    /// Dispatch: GET and HEAD get an empty body buffer, everything else
    /// the raw remainder. Unregistered URIs get a 404.
    fn on_message_body(&mut self, conn: &mut dyn Connection) -> Result<bool, InvalidRequest> {
        let mut body = if self.request.method().ignores_body() {
            ByteBuf::with_capacity(0)
        } else {
            let buf = conn.in_buf();
            let body = ByteBuf::wrap(buf.bytes());
            let len = buf.remaining();
            buf.advance(len);
            body
        };
        let suppress_body = self.request.method() == Method::Head;
        let mut writer =
            ResponseWriter::new(self.pool.clone(), self.request.version(), suppress_body);
        match self.handlers.get(self.request.uri()).cloned() {
            Some(handler) => {
                handler.handle(&mut self.request, &mut body, &mut writer);
                if self.request.body_kind() == BodyKind::Read {
                    if let Some(mut cb) = self.request.take_body_callback() {
                        cb(&mut body);
                    }
                }
            }
            None => {
                debug!("no handler for {}", self.request.uri());
                writer.status(StatusCode::NOT_FOUND);
            }
        }
        self.respond(conn, writer, false);
        Ok(true)
    }

    fn emit_error(&mut self, conn: &mut dyn Connection, status: StatusCode) {
        warn!("responding {} and closing", status);
        conn.in_buf().clear();
        let mut writer = ResponseWriter::new(self.pool.clone(), Version::Http11, false);
        writer.status(status);
        writer.headers_mut().set("Connection", "close");
        self.respond(conn, writer, true);
    }

    fn respond(&mut self, conn: &mut dyn Connection, writer: ResponseWriter, force_close: bool) {
        let close_after = force_close || writer.wants_close();
        let chain = writer.finish();
        self.sending = true;
        let me = self.self_ref.clone();
        conn.send_chain(
            Box::new(move |conn| {
                if let Some(rc) = me.upgrade() {
                    rc.borrow_mut().on_sent(conn, close_after);
                }
            }),
            chain,
        );
    }

    /// The response drained: reset for the next request and re-drive any
    /// bytes that piled up behind it.
    fn on_sent(&mut self, conn: &mut dyn Connection, close_after: bool) {
        self.sending = false;
        if close_after {
            conn.close();
            return;
        }
        self.reset();
        if conn.in_buf().position() > 0 {
            conn.in_buf().flip();
            self.on_recv(conn);
        }
        if !conn.is_closed() {
            conn.resume_recv();
        }
    }

    fn reset(&mut self) {
        self.state = State::RequestStart;
        self.request.clear();
        self.last_header = None;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use crate::buf::{ByteBuf, Pool};
    use crate::conn::Connection;
    use crate::mock::MockConn;

    use super::{
        BodyKind, Handler, HandlerMap, HttpConn, InvalidRequest, Request, ResponseWriter, State,
    };

    fn pool() -> Pool<ByteBuf> {
        Pool::new(8, || ByteBuf::with_capacity(512))
    }

    fn machine(handlers: HandlerMap) -> Rc<RefCell<HttpConn>> {
        HttpConn::shared(Rc::new(handlers), pool())
    }

    fn hello_handlers() -> HandlerMap {
        let mut handlers: HandlerMap = HashMap::new();
        let hello = |_req: &mut Request, _body: &mut ByteBuf, res: &mut ResponseWriter| {
            res.headers_mut().set("Content-Type", "text/html");
            res.write_str("<html><body>Hello</body></html>");
        };
        handlers.insert("/".to_owned(), Rc::new(hello) as Rc<dyn Handler>);
        handlers
    }

    #[test]
    fn test_headers_arrive_in_pieces() {
        let rc = machine(HashMap::new());
        let mut hc = rc.borrow_mut();
        hc.state = State::RequestHeaders;
        let mut buf = ByteBuf::with_capacity(512);
        for chunk in [&b"hello: world\n"[..], b"foo: bar\r\n"] {
            buf.put_slice(chunk);
            buf.flip();
            assert_eq!(hc.on_request_headers(&mut buf), Ok(false));
        }
        buf.put_slice(b"\n");
        buf.flip();
        assert_eq!(hc.on_request_headers(&mut buf), Ok(true));
        assert_eq!(hc.state, State::MessageBody);
        let headers = hc.request.headers();
        assert_eq!(headers.get("Hello").unwrap(), &["world".to_owned()][..]);
        assert_eq!(headers.get("Foo").unwrap(), &["bar".to_owned()][..]);
    }

    #[test]
    fn test_header_continuation_folds() {
        let rc = machine(HashMap::new());
        let mut hc = rc.borrow_mut();
        hc.state = State::RequestHeaders;
        let mut buf = ByteBuf::with_capacity(512);
        for chunk in [&b"hello: world\n"[..], b" hi?\n"] {
            buf.put_slice(chunk);
            buf.flip();
            assert_eq!(hc.on_request_headers(&mut buf), Ok(false));
        }
        buf.put_slice(b"\n");
        buf.flip();
        assert_eq!(hc.on_request_headers(&mut buf), Ok(true));
        let headers = hc.request.headers();
        assert_eq!(headers.get("Hello").unwrap(), &["world hi?".to_owned()][..]);
    }

    #[test]
    fn test_continuation_without_header_is_rejected() {
        let rc = machine(HashMap::new());
        let mut hc = rc.borrow_mut();
        hc.state = State::RequestHeaders;
        let mut buf = ByteBuf::wrap(b" floating\r\n");
        assert_eq!(
            hc.on_request_headers(&mut buf),
            Err(InvalidRequest::new(400))
        );
    }

    #[test]
    fn test_split_delivery_matches_one_shot() {
        let raw = b"POST /p HTTP/1.1\r\nHost: a\r\nX-Long: start\r\n\tmore\r\n\r\n";
        let parse_all = |chunks: &[&[u8]]| {
            let rc = machine(HashMap::new());
            let mut hc = rc.borrow_mut();
            let mut buf = ByteBuf::with_capacity(256);
            for chunk in chunks {
                buf.put_slice(chunk);
                buf.flip();
                loop {
                    let stepped = match hc.state {
                        State::RequestStart => hc.on_request_start(&mut buf).unwrap(),
                        State::RequestHeaders => hc.on_request_headers(&mut buf).unwrap(),
                        _ => break,
                    };
                    if !stepped {
                        break;
                    }
                }
            }
            assert_eq!(hc.state, State::MessageBody);
            format!("{:?}", hc.request)
        };
        let whole = parse_all(&[&raw[..]]);
        for split in 1..raw.len() - 1 {
            let parts = [&raw[..split], &raw[split..]];
            assert_eq!(parse_all(&parts), whole, "split at {}", split);
        }
    }

    #[test]
    fn test_get_dispatch_and_pipelining() {
        let rc = machine(hello_handlers());
        let mut conn = MockConn::new(1024);
        HttpConn::start(&rc, &mut conn);
        conn.feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(conn.complete_sends() >= 1);
        let wire = String::from_utf8(conn.sent.clone()).unwrap();
        assert_eq!(wire.matches("HTTP/1.1 200 OK\r\n").count(), 2, "wire: {}", wire);
        assert_eq!(wire.matches("<html><body>Hello</body></html>").count(), 2);
        assert!(wire.contains("Content-Type: text/html\r\n"));
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_unknown_uri_gets_404() {
        let rc = machine(hello_handlers());
        let mut conn = MockConn::new(1024);
        HttpConn::start(&rc, &mut conn);
        conn.feed(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.complete_sends();
        let wire = String::from_utf8(conn.sent.clone()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"), "wire: {}", wire);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_post_hands_raw_body() {
        let mut handlers: HandlerMap = HashMap::new();
        let echo = |_req: &mut Request, body: &mut ByteBuf, res: &mut ResponseWriter| {
            let bytes = body.bytes().to_vec();
            res.write(&bytes);
        };
        handlers.insert("/echo".to_owned(), Rc::new(echo) as Rc<dyn Handler>);
        let rc = machine(handlers);
        let mut conn = MockConn::new(1024);
        HttpConn::start(&rc, &mut conn);
        conn.feed(b"POST /echo HTTP/1.1\r\nHost: x\r\n\r\nhello body");
        conn.complete_sends();
        let wire = String::from_utf8(conn.sent.clone()).unwrap();
        assert!(wire.contains("Content-Length: 10\r\n"), "wire: {}", wire);
        assert!(wire.ends_with("hello body"));
    }

    #[test]
    fn test_head_suppresses_body() {
        let rc = machine(hello_handlers());
        let mut conn = MockConn::new(1024);
        HttpConn::start(&rc, &mut conn);
        conn.feed(b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.complete_sends();
        let wire = String::from_utf8(conn.sent.clone()).unwrap();
        assert!(wire.contains("Content-Length: 31\r\n"), "wire: {}", wire);
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_bad_request_line_closes_with_400() {
        let rc = machine(hello_handlers());
        let mut conn = MockConn::new(1024);
        HttpConn::start(&rc, &mut conn);
        conn.feed(b"YOINK / HTTP/1.1\r\n");
        conn.complete_sends();
        let wire = String::from_utf8(conn.sent.clone()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"), "wire: {}", wire);
        assert!(wire.contains("Connection: close\r\n"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_overlong_request_line_gets_414() {
        let rc = machine(hello_handlers());
        let mut conn = MockConn::new(64);
        HttpConn::start(&rc, &mut conn);
        let mut line = b"GET /".to_vec();
        line.extend(::std::iter::repeat(b'a').take(128));
        conn.feed(&line);
        conn.complete_sends();
        let wire = String::from_utf8(conn.sent.clone()).unwrap();
        assert!(
            wire.starts_with("HTTP/1.1 414 Request-URI Too Long\r\n"),
            "wire: {}",
            wire
        );
        assert!(conn.is_closed());
    }

    #[test]
    fn test_http10_version_echoed() {
        let rc = machine(hello_handlers());
        let mut conn = MockConn::new(1024);
        HttpConn::start(&rc, &mut conn);
        conn.feed(b"GET / HTTP/1.0\r\n\r\n");
        conn.complete_sends();
        let wire = String::from_utf8(conn.sent.clone()).unwrap();
        assert!(wire.starts_with("HTTP/1.0 200 OK\r\n"), "wire: {}", wire);
    }

    #[test]
    fn test_body_callback_on_read_disposition() {
        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let mut handlers: HandlerMap = HashMap::new();
        let sink = move |req: &mut Request, _body: &mut ByteBuf, _res: &mut ResponseWriter| {
            let seen = seen2.clone();
            req.set_body_kind(BodyKind::Read);
            req.set_body_callback(Box::new(move |body| {
                seen.borrow_mut().extend_from_slice(body.bytes());
            }));
        };
        handlers.insert("/sink".to_owned(), Rc::new(sink) as Rc<dyn Handler>);
        let rc = machine(handlers);
        let mut conn = MockConn::new(1024);
        HttpConn::start(&rc, &mut conn);
        conn.feed(b"PUT /sink HTTP/1.1\r\n\r\npayload");
        conn.complete_sends();
        assert_eq!(&*seen.borrow(), b"payload");
    }
}
