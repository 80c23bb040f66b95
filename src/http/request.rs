//! The incoming request, built once per message and reused across a
//! connection's pipelined requests.

use std::fmt;

use crate::buf::ByteBuf;
use crate::method::Method;
use crate::version::Version;

use super::headers::Headers;

/// What to do with the message body at dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BodyKind {
    /// Discard it (the default).
    Ignore,
    /// Hand the raw bytes to the body callback.
    Read,
    /// Reserved; currently behaves like `Ignore`.
    Copy,
}

pub type BodyCallback = Box<dyn FnMut(&mut ByteBuf)>;

/// An incoming request head plus body disposition.
pub struct Request {
    method: Method,
    uri: String,
    version: Version,
    headers: Headers,
    body: BodyKind,
    body_cb: Option<BodyCallback>,
}

impl Request {
    pub fn new() -> Request {
        Request {
            method: Method::Get,
            uri: String::new(),
            version: Version::Http11,
            headers: Headers::new(),
            body: BodyKind::Ignore,
            body_cb: None,
        }
    }

    pub(crate) fn set_start(&mut self, method: Method, uri: String, version: Version) {
        self.method = method;
        self.uri = uri;
        self.version = version;
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_kind(&self) -> BodyKind {
        self.body
    }

    /// Chooses what happens to the body after the handler returns.
    ///
    /// The body arrives as the single raw chunk left in the input buffer;
    /// no transfer framing is interpreted.
    pub fn set_body_kind(&mut self, kind: BodyKind) {
        self.body = kind;
    }

    pub fn set_body_callback(&mut self, cb: BodyCallback) {
        self.body_cb = Some(cb);
    }

    pub(crate) fn take_body_callback(&mut self) -> Option<BodyCallback> {
        self.body_cb.take()
    }

    /// Resets everything for the next pipelined request.
    pub fn clear(&mut self) {
        self.method = Method::Get;
        self.uri.clear();
        self.version = Version::Http11;
        self.headers.clear();
        self.body = BodyKind::Ignore;
        self.body_cb = None;
    }
}

impl Default for Request {
    fn default() -> Request {
        Request::new()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish()
    }
}
