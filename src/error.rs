//! Error and Result module.
use std::error::Error as StdError;
use std::fmt;
use std::io;

use self::Error::{Closed, Io, Method, TooLarge, Version};

/// Result type often returned from methods that can have `wick` `Error`s.
pub type Result<T> = ::std::result::Result<T, Error>;

/// A set of errors that can occur while serving connections.
#[derive(Debug)]
pub enum Error {
    /// An invalid `Method`, such as `GE,T`.
    Method,
    /// An invalid `HTTP/1.x` version token.
    Version,
    /// A message head exceeded the connection's buffer.
    TooLarge,
    /// The connection was closed before the operation could complete.
    Closed,
    /// An `io::Error` that occurred while trying to read or write to a
    /// network stream.
    Io(io::Error),
    /// An error from the TLS engine.
    #[cfg(feature = "tls")]
    Tls(::rustls::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Io(ref e) => fmt::Display::fmt(e, f),
            #[cfg(feature = "tls")]
            Error::Tls(ref e) => fmt::Display::fmt(e, f),
            ref e => f.write_str(e.description_str()),
        }
    }
}

impl Error {
    fn description_str(&self) -> &'static str {
        match *self {
            Method => "invalid Method specified",
            Version => "invalid HTTP version specified",
            TooLarge => "message head is too large",
            Closed => "connection is closed",
            Io(_) => "an I/O error occurred",
            #[cfg(feature = "tls")]
            Error::Tls(_) => "a TLS error occurred",
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Io(ref e) => Some(e),
            #[cfg(feature = "tls")]
            Error::Tls(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Io(err)
    }
}

#[cfg(feature = "tls")]
impl From<::rustls::Error> for Error {
    fn from(err: ::rustls::Error) -> Error {
        Error::Tls(err)
    }
}
