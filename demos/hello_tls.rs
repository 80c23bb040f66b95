extern crate env_logger;
extern crate wick;

use std::env;
use std::fs::File;
use std::io::BufReader;

use wick::buf::ByteBuf;
use wick::http::{Request, ResponseWriter};
use wick::server::Server;

fn hello(_req: &mut Request, _body: &mut ByteBuf, res: &mut ResponseWriter) {
    res.headers_mut().set("Content-Type", "text/html");
    res.write_str("<html><body>Hello over TLS</body></html>");
}

fn main() {
    let mut positional = Vec::new();
    let mut log = false;
    for arg in env::args().skip(1) {
        if arg == "--log" {
            log = true;
        } else {
            positional.push(arg);
        }
    }
    if log {
        env_logger::init();
    }
    if positional.len() != 3 {
        panic!("usage: hello_tls <port> <cert.pem> <key.pem> [--log]");
    }
    let port: u16 = positional[0].parse().expect("port must be a number");

    let mut server = Server::new().unwrap();
    let mut certs = BufReader::new(File::open(&positional[1]).unwrap());
    let mut key = BufReader::new(File::open(&positional[2]).unwrap());
    server.configure_tls(&mut certs, &mut key).unwrap();
    server.add_handler("/", hello);
    println!("Listening on https://127.0.0.1:{}", port);
    server
        .listen_and_serve(&format!("127.0.0.1:{}", port))
        .unwrap();
}
