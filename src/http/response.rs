//! The response writer.
//!
//! Body bytes go straight into a scatter chain as they are written; the
//! status line and headers are inserted at the front when the response is
//! finished. That keeps large bodies zero-copy while the head still leads
//! on the wire.

use crate::buf::{BufChain, ByteBuf, Pool};
use crate::status::StatusCode;
use crate::version::Version;

use super::headers::Headers;

pub struct ResponseWriter {
    chain: BufChain,
    headers: Headers,
    status: StatusCode,
    version: Version,
    suppress_body: bool,
    body_len: usize,
}

impl ResponseWriter {
    /// A writer for one response. `suppress_body` is set for HEAD
    /// requests: lengths are still counted, bytes are not emitted.
    pub fn new(pool: Pool<ByteBuf>, version: Version, suppress_body: bool) -> ResponseWriter {
        ResponseWriter {
            chain: BufChain::new(pool),
            headers: Headers::new(),
            status: StatusCode::OK,
            version,
            suppress_body,
            body_len: 0,
        }
    }

    pub fn status<S: Into<StatusCode>>(&mut self, status: S) {
        self.status = status.into();
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn write_str(&mut self, body: &str) {
        self.write(body.as_bytes());
    }

    pub fn write(&mut self, body: &[u8]) {
        self.body_len += body.len();
        if !self.suppress_body {
            self.chain.write(body);
        }
    }

    /// Appends an externally built read-mode buffer without copying.
    pub fn append_buf(&mut self, buf: ByteBuf) {
        self.body_len += buf.remaining();
        if !self.suppress_body {
            self.chain.append_buf(buf);
        }
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// Whether the handler asked for the connection to close after this
    /// response drains.
    pub fn wants_close(&self) -> bool {
        self.headers
            .get("Connection")
            .map(|values| values.iter().any(|v| v.eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    }

    /// Seals the response: defaults `Content-Length` to the accumulated
    /// body count, front-inserts the status line and headers, and hands
    /// back the chain ready for a scatter send.
    pub fn finish(mut self) -> BufChain {
        if !self.headers.contains("Content-Length") {
            self.headers.set("Content-Length", &self.body_len.to_string());
        }
        let mut head = self.chain.insert_front();
        head.write_str(&format!("{} {}\r\n", self.version, self.status));
        head.write_str(&self.headers.serialize());
        head.write_str("\r\n");
        match self.chain.close_insert(head) {
            Ok(()) => {}
            // the chain is not written between insert_front and here
            Err(_) => unreachable!("head insertion invalidated"),
        }
        self.chain.finish();
        self.chain
    }
}

#[cfg(test)]
mod tests {
    use crate::buf::{ByteBuf, Pool};
    use crate::version::Version;

    use super::ResponseWriter;

    fn pool() -> Pool<ByteBuf> {
        Pool::new(8, || ByteBuf::with_capacity(256))
    }

    fn output(writer: ResponseWriter) -> String {
        let chain = writer.finish();
        let mut out = Vec::new();
        for slice in chain.io_slices() {
            out.extend_from_slice(&slice);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_head_leads_body() {
        let mut writer = ResponseWriter::new(pool(), Version::Http11, false);
        writer.write_str("<html><body>Hello</body></html>");
        writer.headers_mut().set("Content-Type", "text/html");
        let wire = output(writer);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", wire);
        assert!(wire.contains("Content-Type: text/html\r\n"));
        assert!(wire.contains("Content-Length: 31\r\n"));
        assert!(wire.ends_with("\r\n\r\n<html><body>Hello</body></html>"));
    }

    #[test]
    fn test_status_and_version() {
        let mut writer = ResponseWriter::new(pool(), Version::Http10, false);
        writer.status(404);
        let wire = output(writer);
        assert!(wire.starts_with("HTTP/1.0 404 Not Found\r\n"));
        assert!(wire.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_explicit_content_length_kept() {
        let mut writer = ResponseWriter::new(pool(), Version::Http11, false);
        writer.headers_mut().set("Content-Length", "99");
        writer.write_str("short");
        let wire = output(writer);
        assert!(wire.contains("Content-Length: 99\r\n"));
    }

    #[test]
    fn test_head_suppresses_body_keeps_length() {
        let mut writer = ResponseWriter::new(pool(), Version::Http11, true);
        writer.write_str("invisible");
        let wire = output(writer);
        assert!(wire.contains("Content-Length: 9\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_zero_copy_body_buffer() {
        let mut writer = ResponseWriter::new(pool(), Version::Http11, false);
        writer.append_buf(ByteBuf::wrap(b"payload"));
        let wire = output(writer);
        assert!(wire.contains("Content-Length: 7\r\n"));
        assert!(wire.ends_with("payload"));
    }

    #[test]
    fn test_wants_close() {
        let mut writer = ResponseWriter::new(pool(), Version::Http11, false);
        assert!(!writer.wants_close());
        writer.headers_mut().set("Connection", "close");
        assert!(writer.wants_close());
    }
}
