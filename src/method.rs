//! The HTTP request method.
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use self::Method::{Connect, Delete, Get, Head, Options, Post, Put, Trace};

/// The request method, limited to the eight RFC 2616 verbs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Method {
    /// OPTIONS
    Options,
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// TRACE
    Trace,
    /// CONNECT
    Connect,
}

impl Method {
    /// Whether a request with this method carries no body to deliver.
    ///
    /// GET and HEAD requests have their remaining input discarded before
    /// dispatch; every other method hands the raw remainder to the handler.
    pub fn ignores_body(&self) -> bool {
        matches!(*self, Get | Head)
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            Options => "OPTIONS",
            Get => "GET",
            Head => "HEAD",
            Post => "POST",
            Put => "PUT",
            Delete => "DELETE",
            Trace => "TRACE",
            Connect => "CONNECT",
        }
    }
}

impl FromStr for Method {
    type Err = Error;
    fn from_str(s: &str) -> Result<Method, Error> {
        match s {
            "OPTIONS" => Ok(Options),
            "GET" => Ok(Get),
            "HEAD" => Ok(Head),
            "POST" => Ok(Post),
            "PUT" => Ok(Put),
            "DELETE" => Ok(Delete),
            "TRACE" => Ok(Trace),
            "CONNECT" => Ok(Connect),
            _ => Err(Error::Method),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
