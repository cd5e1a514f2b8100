//! Minimal HTTP/1.1 framing: `GET` request lines in, complete replies out.
//!
//! Every cached payload is a full reply (status line, headers and body),
//! so a hit is served by writing the payload bytes as they are.

use bytes::{BufMut, Bytes, BytesMut};

use crate::key::Key;

/// Reply cached for keys that have no content.
pub const NOT_FOUND_REPLY: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";

/// Reply for requests that cannot be parsed.
pub const BAD_REQUEST_REPLY: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 11\r\n\r\nBad Request";

/// Largest request head accepted before the connection is rejected.
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Wraps `body` in a `200 OK` reply.
pub fn ok_reply(body: &[u8]) -> Bytes {
    let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    let mut reply = BytesMut::with_capacity(header.len() + body.len());
    reply.put_slice(header.as_bytes());
    reply.put_slice(body);
    reply.freeze()
}

/// The canned not-found reply as shared bytes.
pub fn not_found() -> Bytes {
    Bytes::from_static(NOT_FOUND_REPLY)
}

/// Outcome of [`parse_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// More bytes are needed.
    Incomplete,
    /// A complete `GET` request for `uri`, occupying `consumed` bytes.
    Request {
        /// Request target, used as the cache key.
        uri: Key,
        /// Length of the request head including the blank line.
        consumed: usize,
    },
    /// The buffer does not hold a supported request.
    Invalid,
}

/// Parses one request head from the front of `buf`.
///
/// Only `GET` is supported. Headers are skipped and request bodies are not
/// expected. An empty query is dropped from the target, so `/a.jpg?` and
/// `/a.jpg` share one cache key.
pub fn parse_request(buf: &[u8]) -> Parsed {
    let Some(end) = find_head_end(buf) else {
        return if buf.len() > MAX_REQUEST_HEAD {
            Parsed::Invalid
        } else {
            Parsed::Incomplete
        };
    };

    let line_end = buf[..end]
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(end);
    let mut parts = buf[..line_end].split(|&b| b == b' ').filter(|p| !p.is_empty());
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Parsed::Invalid;
    };
    if method != b"GET" || !version.starts_with(b"HTTP/1.") || !target.starts_with(b"/") {
        return Parsed::Invalid;
    }

    Parsed::Request {
        uri: Key::from(target.strip_suffix(b"?").unwrap_or(target)),
        consumed: end + 4,
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Splits a reply produced by this module into its body.
pub fn reply_body(reply: &[u8]) -> Option<&[u8]> {
    find_head_end(reply).map(|end| &reply[end + 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_reply() {
        let reply = ok_reply(b"abc");
        assert_eq!(&reply[..], b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc");
        assert_eq!(reply_body(&reply), Some(&b"abc"[..]));
    }

    #[test]
    fn test_not_found_body_length() {
        assert_eq!(reply_body(NOT_FOUND_REPLY), Some(&b"Not Found"[..]));
        assert_eq!(reply_body(BAD_REQUEST_REPLY).map(<[u8]>::len), Some(11));
    }

    #[test]
    fn test_parse_get() {
        let req = b"GET /static/a.png HTTP/1.1\r\nHost: x\r\n\r\nGET /b";
        assert_eq!(
            parse_request(req),
            Parsed::Request {
                uri: Key::from("/static/a.png"),
                consumed: 39,
            }
        );
        assert_eq!(parse_request(&req[39..]), Parsed::Incomplete);
    }

    #[test]
    fn test_parse_drops_empty_query() {
        let req = b"GET /zoom/cat.jpg? HTTP/1.1\r\n\r\n";
        assert_eq!(
            parse_request(req),
            Parsed::Request {
                uri: Key::from("/zoom/cat.jpg"),
                consumed: req.len(),
            }
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(parse_request(b"POST / HTTP/1.1\r\n\r\n"), Parsed::Invalid);
        assert_eq!(parse_request(b"GET /\r\n\r\n"), Parsed::Invalid);
        assert_eq!(parse_request(b"GET x HTTP/1.1\r\n\r\n"), Parsed::Invalid);
        assert_eq!(parse_request(&[b'a'; MAX_REQUEST_HEAD + 1]), Parsed::Invalid);
    }
}
