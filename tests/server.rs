extern crate wick;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use wick::buf::ByteBuf;
use wick::http::{Request, ResponseWriter};
use wick::reactor::Handle;
use wick::server::Server;

const HELLO: &str = "<html><body>Hello</body></html>";

struct Serve {
    addr: SocketAddr,
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Serve {
    fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for Serve {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

fn hello(_req: &mut Request, _body: &mut ByteBuf, res: &mut ResponseWriter) {
    res.headers_mut().set("Content-Type", "text/html");
    res.write_str(HELLO);
}

fn echo(_req: &mut Request, body: &mut ByteBuf, res: &mut ResponseWriter) {
    let bytes = body.bytes().to_vec();
    res.write(&bytes);
}

fn goodbye(_req: &mut Request, _body: &mut ByteBuf, res: &mut ResponseWriter) {
    res.headers_mut().set("Connection", "close");
    res.write_str("bye");
}

fn serve() -> Serve {
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let mut server = Server::new().unwrap();
        server.add_handler("/", hello);
        server.add_handler("/echo", echo);
        server.add_handler("/goodbye", goodbye);
        let addr = server.bind("127.0.0.1:0").unwrap();
        tx.send((addr, server.handle())).unwrap();
        server.serve().unwrap();
    });
    let (addr, handle) = rx.recv().unwrap();
    Serve {
        addr,
        handle,
        thread: Some(thread),
    }
}

/// Reads until `enough` says so or the peer hangs up.
fn read_until<F: Fn(&[u8]) -> bool>(sock: &mut TcpStream, enough: F) -> Vec<u8> {
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut got = Vec::new();
    let mut buf = [0u8; 4096];
    while !enough(&got) {
        match sock.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => got.extend_from_slice(&buf[..n]),
            Err(e) => panic!(
                "read failed: {} (so far: {:?})",
                e,
                String::from_utf8_lossy(&got)
            ),
        }
    }
    got
}

fn count(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

#[test]
fn server_get_hello() {
    let server = serve();
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.write_all(b"GET / HTTP/1.1\r\nHost: example.domain\r\n\r\n")
        .unwrap();
    let got = read_until(&mut sock, |g| {
        String::from_utf8_lossy(g).contains(HELLO)
    });
    let got = String::from_utf8(got).unwrap();
    assert!(got.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", got);
    assert!(got.contains("Content-Type: text/html\r\n"));
    assert!(got.contains(&format!("Content-Length: {}\r\n", HELLO.len())));
}

#[test]
fn server_pipelined_get() {
    let server = serve();
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.write_all(
        b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n",
    )
    .unwrap();
    let got = read_until(&mut sock, |g| {
        count(&String::from_utf8_lossy(g), HELLO) >= 2
    });
    let got = String::from_utf8(got).unwrap();
    assert_eq!(count(&got, "HTTP/1.1 200 OK\r\n"), 2, "got: {}", got);
    assert_eq!(count(&got, HELLO), 2);
    assert_eq!(count(&got, "Content-Type: text/html\r\n"), 2);
}

#[test]
fn server_unknown_uri_is_404() {
    let server = serve();
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.write_all(b"GET /nothing-here HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let got = read_until(&mut sock, |g| {
        String::from_utf8_lossy(g).contains("\r\n\r\n")
    });
    let got = String::from_utf8(got).unwrap();
    assert!(got.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {}", got);
    assert!(got.contains("Content-Length: 0\r\n"));
}

#[test]
fn server_post_echoes_raw_body() {
    let server = serve();
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\n\r\nI'm a good request.")
        .unwrap();
    let got = read_until(&mut sock, |g| {
        String::from_utf8_lossy(g).ends_with("I'm a good request.")
    });
    let got = String::from_utf8(got).unwrap();
    assert!(got.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", got);
    assert!(got.contains("Content-Length: 19\r\n"));
}

#[test]
fn server_get_ignores_trailing_bytes() {
    let server = serve();
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.write_all(b"GET / HTTP/1.1\r\nHost: example.domain\r\n\r\nI shouldn't be read.\r\n")
        .unwrap();
    let got = read_until(&mut sock, |g| {
        String::from_utf8_lossy(g).contains(HELLO)
    });
    let got = String::from_utf8(got).unwrap();
    // the first response is intact; the garbage after it does not leak
    // into the body
    assert!(got.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", got);
    assert_eq!(count(&got, HELLO), 1);
}

#[test]
fn server_rejects_bad_method() {
    let server = serve();
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.write_all(b"YOINK / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    // the server answers 400 and closes, so read to EOF
    let got = read_until(&mut sock, |_| false);
    let got = String::from_utf8(got).unwrap();
    assert!(got.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {}", got);
    assert!(got.contains("Connection: close\r\n"));
}

#[test]
fn server_handler_forces_close() {
    let server = serve();
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.write_all(b"GET /goodbye HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let got = read_until(&mut sock, |_| false);
    let got = String::from_utf8(got).unwrap();
    assert!(got.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", got);
    assert!(got.contains("Connection: close\r\n"));
    assert!(got.ends_with("bye"));
}

#[test]
fn server_folded_header_is_accepted() {
    let server = serve();
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nX-Note: hello\r\n world\r\n\r\n")
        .unwrap();
    let got = read_until(&mut sock, |g| {
        String::from_utf8_lossy(g).contains(HELLO)
    });
    let got = String::from_utf8(got).unwrap();
    assert!(got.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", got);
}

#[test]
fn server_many_connections() {
    let server = serve();
    for _ in 0..8 {
        let mut sock = TcpStream::connect(server.addr()).unwrap();
        sock.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let got = read_until(&mut sock, |g| {
            String::from_utf8_lossy(g).contains(HELLO)
        });
        assert!(!got.is_empty());
    }
}

#[test]
fn server_stops_cleanly() {
    let server = serve();
    let addr = server.addr();
    drop(server);
    // the listener is gone shortly after stop
    thread::sleep(Duration::from_millis(50));
    match TcpStream::connect(addr) {
        Err(_) => {}
        Ok(mut sock) => {
            // a racing connect may complete; the socket must be dead
            sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let _ = sock.write_all(b"GET / HTTP/1.1\r\n\r\n");
            assert!(matches!(sock.read(&mut [0u8; 16]), Ok(0) | Err(_)));
        }
    }
}
