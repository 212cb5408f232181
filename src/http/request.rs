//! Request-line, header, and body parsing.
//!
//! Parsing runs over a linear scratch buffer (see [`Parser`]) rather than
//! directly over the session's [`crate::buffer::RingBuffer`]: the ring
//! buffer's contiguous views never span its wrap point, which makes it
//! awkward to scan for a delimiter that might straddle the seam. Each parse
//! attempt snapshots the ring buffer's unconsumed bytes into the scratch
//! buffer with [`Parser::refill`] and re-scans from the start. Requests are
//! small relative to the buffer capacity, so re-scanning on every partial
//! read is cheap and keeps the state machine simple: there is no partial
//! parse state to carry between a [`ErrorKind::NeedMore`] result and the
//! next attempt.
//!
//! On success the session advances the ring buffer's read position by
//! [`Parser::position`] bytes; `Request`'s fields keep pointing into the
//! scratch buffer until the next request is parsed.

use crate::{
    buffer::RingBuffer,
    config::{ServerConfig, MAX_HEADER_COUNT, MAX_QUERY_PARAM_COUNT},
    errors::ErrorKind,
    http::types::{into_lower_case, slice_to_usize, Header, HeaderMap, Method, Url, Version},
};
use memchr::{memchr, memchr_iter};

/// Longest method token this server will scan for before giving up.
/// `"OPTIONS"` (7 bytes) is the longest recognized method; this leaves
/// headroom for unrecognized-but-plausible tokens to still parse as
/// [`Method::Unknown`] rather than erroring out early.
const MAX_METHOD_TOKEN: usize = 16;

/// Shortest byte count a complete request line plus terminating blank line
/// could possibly occupy (e.g. `"GET / HTTP/1.1\r\n\r\n"` is 18 bytes; this
/// stays a little under that to admit any future shorter method token).
/// Anything shorter than this can never contain a complete request, so
/// [`Request::parse`] reports [`ErrorKind::NeedMore`] immediately instead of
/// running the parser over a fragment it already knows is incomplete.
const MIN_REQUEST_SIZE: usize = 16;

/// Longest header key this server accepts, per spec.md §4.C's edge
/// policies ("Header key length is bounded by a design constant (e.g.
/// 256)") — a bound distinct from the total-header-block-size ceiling the
/// read buffer's capacity already imposes.
const HEADER_KEY_MAX_LEN: usize = 256;

/// High-performance HTTP request representation.
///
/// All data is borrowed from the session's [`Parser`] scratch buffer rather
/// than owned, to avoid allocating or copying for every field of every
/// request.
#[derive(Debug, Clone, PartialEq)]
#[repr(align(128))]
pub struct Request {
    method: Method,
    url: Url,
    version: Version,
    headers: HeaderMap,
    body: &'static [u8],
}

impl Request {
    #[inline(always)]
    pub(crate) fn new(config: &ServerConfig) -> Self {
        Request {
            method: Method::Get,
            url: Url::new(&config.parse_limits),
            version: Version::Http11,
            headers: HeaderMap::new(config.parse_limits.header_count),
            body: b"",
        }
    }

    #[inline(always)]
    pub(crate) fn clear(&mut self) {
        self.method = Method::Get;
        self.url.clear();
        self.version = Version::Http11;
        self.headers.reset();
        self.body = b"";
    }
}

// Public API
impl Request {
    /// Returns the HTTP method.
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Returns the parsed URL.
    #[inline(always)]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the HTTP version.
    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the value of the named header, performing a case-insensitive
    /// lookup.
    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// Returns the `Content-Length` of the request, if the header was
    /// present and valid.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.headers.content_length
    }

    /// Returns the request body. Empty when the request carried no body.
    #[inline(always)]
    pub const fn body(&self) -> &[u8] {
        self.body
    }
}

/// Outcome of a successful [`Request::parse`] call.
pub(crate) struct ParseOutcome {
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
}

impl Request {
    /// Attempts to parse one request out of `parser`'s current snapshot.
    ///
    /// On [`ErrorKind::NeedMore`], `parser` has not been advanced and the
    /// caller should refill it (with more bytes from the ring buffer) and
    /// retry. On any other `Err`, the connection is protocol-broken and
    /// should be closed after a best-effort error response. On `Ok`, the
    /// caller drains `parser.position()` bytes off the ring buffer.
    pub(crate) fn parse(
        &mut self,
        parser: &mut Parser,
        config: &ServerConfig,
    ) -> Result<ParseOutcome, ErrorKind> {
        parser.restart();
        self.clear();

        if parser.available() < MIN_REQUEST_SIZE {
            return Err(ErrorKind::NeedMore);
        }

        self.method = parse_method(parser)?;
        parse_url(&mut self.url, parser)?;
        let (version, mut keep_alive) = parse_version(parser)?;
        self.version = version;

        parse_headers(&mut self.headers, parser)?;

        if let Some(connection) = self.headers.get(b"connection") {
            keep_alive = match () {
                _ if connection.eq_ignore_ascii_case(b"close") => false,
                _ if connection.eq_ignore_ascii_case(b"keep-alive") => true,
                _ => return Err(ErrorKind::InvalidConnection),
            };
        }

        self.body = parse_body(&self.headers, parser, config)?;

        Ok(ParseOutcome { version, keep_alive })
    }
}

#[inline(always)]
fn parse_method(parser: &mut Parser) -> Result<Method, ErrorKind> {
    let idx = parser.find(MAX_METHOD_TOKEN, b' ', ErrorKind::InvalidMethod)?;
    let token = parser.slice(idx);
    let method = Method::from_bytes(token);
    parser.advance(idx + 1);
    Ok(method)
}

fn parse_url(url: &mut Url, parser: &mut Parser) -> Result<(), ErrorKind> {
    let idx = parser.find(parser.capacity(), b' ', ErrorKind::InvalidUrl)?;
    if idx == 0 || parser.slice(idx)[0] != b'/' {
        return Err(ErrorKind::InvalidUrl);
    }

    let target = parser.take_static(idx);
    parser.advance(1); // the space

    let (path, query) = match memchr(b'?', target) {
        Some(q) => (&target[..q], Some(&target[q..])),
        None => (target, None),
    };

    url.target = target;
    url.path = path;
    url.query = query;

    url.parts.clear();
    for (start, end) in segment_bounds(path) {
        url.parts.push(&path[start..end]);
    }

    url.query_parts.clear();
    if let Some(raw_query) = query {
        let pairs: Vec<(&[u8], &[u8])> =
            crate::http::query::Query::parse(raw_query, MAX_QUERY_PARAM_COUNT)?;
        for (key, value) in pairs {
            url.query_parts
                .push((crate::url::decode(key), crate::url::decode(value)));
        }
    }

    Ok(())
}

/// Splits `path` (which always begins with `/`) on `/`, skipping the empty
/// leading segment and collapsing a trailing slash into no extra segment.
fn segment_bounds(path: &[u8]) -> impl Iterator<Item = (usize, usize)> + '_ {
    let body = &path[1.min(path.len())..];
    let mut start = 0usize;
    let offset = 1;
    memchr_iter(b'/', body)
        .chain(std::iter::once(body.len()))
        .filter_map(move |end| {
            let piece = (start + offset, end + offset);
            start = end + 1;
            if piece.0 < piece.1 {
                Some(piece)
            } else {
                None
            }
        })
}

fn parse_version(parser: &mut Parser) -> Result<(Version, bool), ErrorKind> {
    parser.require(10, ErrorKind::InvalidVersion)?;
    let (version, keep_alive) =
        Version::from_bytes(parser.slice(8)).ok_or(ErrorKind::InvalidVersion)?;
    if parser.slice_at(8, 10) != b"\r\n" {
        return Err(ErrorKind::InvalidVersion);
    }
    parser.advance(10);
    Ok((version, keep_alive))
}

fn parse_headers(headers: &mut HeaderMap, parser: &mut Parser) -> Result<(), ErrorKind> {
    loop {
        parser.require(2, ErrorKind::InvalidHeader)?;
        if parser.slice(2) == b"\r\n" {
            parser.advance(2);
            return Ok(());
        }

        if headers.headers.len() >= MAX_HEADER_COUNT {
            return Err(ErrorKind::TooManyHeaders);
        }

        let line_end = parser.find(parser.capacity(), b'\r', ErrorKind::InvalidHeader)?;
        parser.require(line_end + 2, ErrorKind::InvalidHeader)?;
        if parser.slice_at(line_end, line_end + 2) != b"\r\n" {
            return Err(ErrorKind::InvalidHeader);
        }

        let line = parser.slice(line_end);
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        if colon == 0 || colon > HEADER_KEY_MAX_LEN {
            return Err(ErrorKind::InvalidHeader);
        }
        let value_start = colon + 1 + if line.get(colon + 1) == Some(&b' ') { 1 } else { 0 };

        let name = parser.take_static_range(0, colon);
        let value = parser.take_static_range(value_start, line_end);

        if is_special_header(name, b"content-length") {
            if headers.content_length.is_some() {
                return Err(ErrorKind::InvalidContentLength);
            }
            headers.content_length =
                Some(slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?);
        }

        headers.headers.push(Header::new(name, value));
        parser.advance(line_end + 2);
    }
}

#[inline(always)]
fn is_special_header(name: &[u8], target: &[u8]) -> bool {
    let mut lower = [0u8; 32];
    let len = into_lower_case(name, &mut lower);
    len == target.len() && &lower[..len] == target
}

fn parse_body(
    headers: &HeaderMap,
    parser: &mut Parser,
    config: &ServerConfig,
) -> Result<&'static [u8], ErrorKind> {
    let Some(len) = headers.content_length else {
        return Ok(b"");
    };

    if len as u64 > config.max_body_size {
        return Err(ErrorKind::BodyTooLarge);
    }

    parser.require(len, ErrorKind::BodyTooLarge)?;
    let body = parser.take_static(len);
    parser.advance(len);
    Ok(body)
}

/// Linear scratch buffer a [`Request`] is parsed out of.
///
/// Owned by the session for the lifetime of the connection. `refill` copies
/// the ring buffer's unconsumed bytes in (without draining the ring
/// buffer); a successful parse tells the caller how many of those bytes
/// belonged to this request via [`Parser::position`], which the caller then
/// drains from the ring buffer itself.
#[repr(align(64))]
pub(crate) struct Parser {
    position: usize,
    len: usize,
    buffer: Box<[u8]>,
}

impl Parser {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            position: 0,
            len: 0,
            buffer: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    pub(crate) fn position(&self) -> usize {
        self.position
    }

    #[inline(always)]
    fn available(&self) -> usize {
        self.len - self.position
    }

    /// Snapshots `ring`'s unconsumed bytes into the scratch buffer and
    /// resets the scan cursor to the start.
    pub(crate) fn refill(&mut self, ring: &RingBuffer) {
        self.len = ring.peek(&mut self.buffer);
        self.position = 0;
    }

    /// Resets the scan cursor without re-copying from the ring buffer
    /// (parsing always restarts a fresh attempt from byte zero).
    fn restart(&mut self) {
        self.position = 0;
    }

    #[inline(always)]
    fn slice(&self, len: usize) -> &[u8] {
        &self.buffer[self.position..self.position + len]
    }

    #[inline(always)]
    fn slice_at(&self, from: usize, to: usize) -> &[u8] {
        &self.buffer[self.position + from..self.position + to]
    }

    /// Extends a borrow of the scratch buffer to `'static`.
    ///
    /// Safe because the scratch buffer is owned by the session for the
    /// entire lifetime of the connection, and `Request`'s fields (which
    /// carry these references) are only read while that same session is
    /// handling that same request — well within the buffer's real
    /// lifetime. The buffer is never freed or reallocated; only its bytes
    /// are overwritten, by the next call to `refill`, which happens only
    /// after the current request has been fully handled and responded to.
    #[inline(always)]
    unsafe fn into_static(src: &[u8]) -> &'static [u8] {
        std::mem::transmute(src)
    }

    #[inline(always)]
    fn take_static(&self, len: usize) -> &'static [u8] {
        unsafe { Self::into_static(self.slice(len)) }
    }

    #[inline(always)]
    fn take_static_range(&self, from: usize, to: usize) -> &'static [u8] {
        unsafe { Self::into_static(self.slice_at(from, to)) }
    }

    fn advance(&mut self, n: usize) {
        self.position += n;
    }

    /// Requires `n` more bytes to be available from the cursor onward.
    fn require(&self, n: usize, too_large: ErrorKind) -> Result<(), ErrorKind> {
        if self.available() >= n {
            Ok(())
        } else if self.len < self.capacity() {
            Err(ErrorKind::NeedMore)
        } else {
            Err(too_large)
        }
    }

    /// Scans for `delimiter` within the next `cap.min(available)` bytes
    /// from the cursor. `too_large` is returned when the scan reaches
    /// either `cap` or the end of a completely full buffer without finding
    /// it; otherwise (the window was cut short only by data not having
    /// arrived yet) [`ErrorKind::NeedMore`] is returned.
    fn find(&self, cap: usize, delimiter: u8, too_large: ErrorKind) -> Result<usize, ErrorKind> {
        let window_len = cap.min(self.available());
        let window = &self.buffer[self.position..self.position + window_len];
        match memchr(delimiter, window) {
            Some(idx) => Ok(idx),
            None if window_len == cap || self.len == self.capacity() => Err(too_large),
            None => Err(ErrorKind::NeedMore),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;

    fn parser_from(bytes: &[u8], capacity: usize) -> Parser {
        let mut ring = RingBuffer::new(capacity);
        ring.write(bytes);
        let mut parser = Parser::new(capacity);
        parser.refill(&ring);
        parser
    }

    #[test]
    fn parses_simple_get_request() {
        let mut parser = parser_from(b"GET /hello?a=1&b=2 HTTP/1.1\r\nHost: x\r\n\r\n", 256);
        let mut request = Request::new(&ServerConfig::default());

        let outcome = request.parse(&mut parser, &ServerConfig::default()).unwrap();

        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.url().path(), b"/hello");
        assert_eq!(request.url().query(b"a"), Some(b"1".as_slice()));
        assert_eq!(request.url().query(b"b"), Some(b"2".as_slice()));
        assert_eq!(outcome.version, Version::Http11);
        assert!(outcome.keep_alive);
        assert_eq!(parser.position(), 40);
    }

    #[test]
    fn unknown_method_parses_instead_of_erroring() {
        let mut parser = parser_from(b"PROPFIND / HTTP/1.1\r\n\r\n", 256);
        let mut request = Request::new(&ServerConfig::default());
        request.parse(&mut parser, &ServerConfig::default()).unwrap();
        assert_eq!(request.method(), Method::Unknown);
    }

    #[test]
    fn incomplete_request_reports_need_more() {
        let mut ring = RingBuffer::new(256);
        ring.write(b"GET /x HTTP/1.1\r\nHost:");
        let mut parser = Parser::new(256);
        parser.refill(&ring);

        let mut request = Request::new(&ServerConfig::default());
        let err = request
            .parse(&mut parser, &ServerConfig::default())
            .unwrap_err();
        assert_eq!(err, ErrorKind::NeedMore);
    }

    #[test]
    fn oversized_request_line_is_rejected_once_buffer_is_full() {
        let capacity = 32;
        let mut ring = RingBuffer::new(capacity);
        ring.write(&vec![b'a'; capacity]); // no spaces anywhere: fills the buffer
        let mut parser = Parser::new(capacity);
        parser.refill(&ring);

        let mut request = Request::new(&ServerConfig::default());
        let err = request
            .parse(&mut parser, &ServerConfig::default())
            .unwrap_err();
        assert_eq!(err, ErrorKind::InvalidMethod);
    }

    #[test]
    fn body_is_read_according_to_content_length() {
        let mut parser = parser_from(
            b"POST /submit HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello",
            256,
        );
        let mut request = Request::new(&ServerConfig::default());
        request.parse(&mut parser, &ServerConfig::default()).unwrap();
        assert_eq!(request.body(), b"hello");
        assert_eq!(request.content_length(), Some(5));
    }

    #[test]
    fn body_larger_than_max_body_size_is_rejected() {
        let mut config = ServerConfig::default();
        config.max_body_size = 2;
        let mut parser = parser_from(
            b"POST /submit HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello",
            256,
        );
        let mut request = Request::new(&config);
        let err = request.parse(&mut parser, &config).unwrap_err();
        assert_eq!(err, ErrorKind::BodyTooLarge);
    }

    #[test]
    fn explicit_connection_close_overrides_http11_default() {
        let mut parser = parser_from(
            b"GET / HTTP/1.1\r\nconnection: close\r\n\r\n",
            256,
        );
        let mut request = Request::new(&ServerConfig::default());
        let outcome = request.parse(&mut parser, &ServerConfig::default()).unwrap();
        assert!(!outcome.keep_alive);
    }

    #[test]
    fn duplicate_content_length_is_rejected() {
        let mut parser = parser_from(
            b"POST /submit HTTP/1.1\r\ncontent-length: 5\r\ncontent-length: 5\r\n\r\nhello",
            256,
        );
        let mut request = Request::new(&ServerConfig::default());
        let err = request
            .parse(&mut parser, &ServerConfig::default())
            .unwrap_err();
        assert_eq!(err, ErrorKind::InvalidContentLength);
    }

    #[test]
    fn too_many_headers_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..MAX_HEADER_COUNT + 1 {
            raw.extend_from_slice(format!("x-{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");

        let mut parser = parser_from(&raw, 16 * 1024);
        let mut request = Request::new(&ServerConfig::default());
        let err = request
            .parse(&mut parser, &ServerConfig::default())
            .unwrap_err();
        assert_eq!(err, ErrorKind::TooManyHeaders);
    }

    #[test]
    fn oversized_header_key_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend_from_slice(&vec![b'x'; HEADER_KEY_MAX_LEN + 1]);
        raw.extend_from_slice(b": v\r\n\r\n");

        let mut parser = parser_from(&raw, 16 * 1024);
        let mut request = Request::new(&ServerConfig::default());
        let err = request
            .parse(&mut parser, &ServerConfig::default())
            .unwrap_err();
        assert_eq!(err, ErrorKind::InvalidHeader);
    }

    #[test]
    fn too_many_query_params_is_rejected() {
        let mut target = b"GET /search?".to_vec();
        for i in 0..MAX_QUERY_PARAM_COUNT + 1 {
            target.extend_from_slice(format!("k{i}=v&").as_bytes());
        }
        target.extend_from_slice(b" HTTP/1.1\r\n\r\n");

        let mut parser = parser_from(&target, 16 * 1024);
        let mut request = Request::new(&ServerConfig::default());
        let err = request
            .parse(&mut parser, &ServerConfig::default())
            .unwrap_err();
        assert_eq!(err, ErrorKind::Query(crate::http::query::Error::OverLimit(MAX_QUERY_PARAM_COUNT)));
    }
}
