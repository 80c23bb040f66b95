//! Incremental parsers for the request head.
//!
//! Everything here works on a read-mode input buffer and is restartable:
//! an incomplete element compacts what is left to the front of the buffer
//! and asks the connection for more bytes.

use std::str;

use crate::buf::ByteBuf;
use crate::method::Method;
use crate::version::Version;

/// A request the parser rejected, carrying the response status to emit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InvalidRequest {
    pub status: u16,
}

impl InvalidRequest {
    pub fn new(status: u16) -> InvalidRequest {
        InvalidRequest { status }
    }
}

const SEPARATORS: &[u8] = b"()<>@,;:\\\"/[]?={} \t";

#[inline]
fn is_ctl(byte: u8) -> bool {
    byte <= 31 || byte == 127
}

/// A token octet: not a control character, not a separator.
#[inline]
pub fn is_token(byte: u8) -> bool {
    !is_ctl(byte) && !SEPARATORS.contains(&byte)
}

/// A text octet: anything that is not a control character.
#[inline]
pub fn is_text(byte: u8) -> bool {
    !is_ctl(byte)
}

/// Scans for the next line feed, returning the line without its
/// terminator; one trailing carriage return is dropped.
///
/// With no terminator in sight, the unread remainder is compacted to the
/// front of the buffer and `None` asks for more input, unless the buffer
/// is already full from position zero, in which case the line can never
/// complete (414).
pub fn parse_line(buf: &mut ByteBuf) -> Result<Option<Vec<u8>>, InvalidRequest> {
    match buf.bytes().iter().position(|&b| b == b'\n') {
        Some(lf) => {
            let mut end = lf;
            if end > 0 && buf.bytes()[end - 1] == b'\r' {
                end -= 1;
            }
            let line = buf.bytes()[..end].to_vec();
            buf.advance(lf + 1);
            Ok(Some(line))
        }
        None => {
            if buf.position() == 0 && buf.limit() == buf.capacity() {
                return Err(InvalidRequest::new(414));
            }
            buf.compact();
            Ok(None)
        }
    }
}

/// Parses `METHOD SP URI SP HTTP/1.x`.
pub fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), InvalidRequest> {
    let text = str::from_utf8(line).map_err(|_| InvalidRequest::new(400))?;
    let mut words = text.split_whitespace();
    let method = words
        .next()
        .and_then(|w| w.parse::<Method>().ok())
        .ok_or_else(|| InvalidRequest::new(400))?;
    let uri = words.next().ok_or_else(|| InvalidRequest::new(400))?;
    if !uri.bytes().all(is_text) {
        return Err(InvalidRequest::new(400));
    }
    let version = parse_version(words.next().ok_or_else(|| InvalidRequest::new(400))?)?;
    if words.next().is_some() {
        return Err(InvalidRequest::new(400));
    }
    Ok((method, uri.to_owned(), version))
}

/// Parses the `HTTP/1.(0|1)` version token.
pub fn parse_version(word: &str) -> Result<Version, InvalidRequest> {
    let minor = word
        .strip_prefix("HTTP/1.")
        .ok_or_else(|| InvalidRequest::new(400))?;
    match minor {
        "0" => Ok(Version::Http10),
        "1" => Ok(Version::Http11),
        _ => Err(InvalidRequest::new(400)),
    }
}

/// Splits a header line into its token name and right-trimmed text value.
pub fn parse_header(line: &[u8]) -> Result<(String, String), InvalidRequest> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| InvalidRequest::new(400))?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token(b)) {
        return Err(InvalidRequest::new(400));
    }
    let value = trim_value(&line[colon + 1..])?;
    let name = str::from_utf8(name).map_err(|_| InvalidRequest::new(400))?;
    Ok((name.to_owned(), value))
}

/// Trims surrounding whitespace from a header (or continuation) value and
/// checks it for text octets.
pub fn trim_value(bytes: &[u8]) -> Result<String, InvalidRequest> {
    let text = str::from_utf8(bytes).map_err(|_| InvalidRequest::new(400))?;
    let text = text.trim_matches(|c| c == ' ' || c == '\t');
    if !text.bytes().all(|b| is_text(b) || b == b' ' || b == b'\t') {
        return Err(InvalidRequest::new(400));
    }
    Ok(text.to_owned())
}
