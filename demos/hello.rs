extern crate env_logger;
extern crate wick;

use std::env;

use wick::buf::ByteBuf;
use wick::http::{Request, ResponseWriter};
use wick::server::Server;

fn hello(_req: &mut Request, _body: &mut ByteBuf, res: &mut ResponseWriter) {
    res.headers_mut().set("Content-Type", "text/html");
    res.write_str("<html><body>Hello</body></html>");
}

fn main() {
    let mut port = None;
    let mut log = false;
    for arg in env::args().skip(1) {
        if arg == "--log" {
            log = true;
        } else {
            port = Some(arg);
        }
    }
    if log {
        env_logger::init();
    }
    let port: u16 = port
        .expect("usage: hello <port> [--log]")
        .parse()
        .expect("port must be a number");

    let mut server = Server::new().unwrap();
    server.add_handler("/", hello);
    println!("Listening on http://127.0.0.1:{}", port);
    server
        .listen_and_serve(&format!("127.0.0.1:{}", port))
        .unwrap();
}
