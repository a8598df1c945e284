//! Incremental HTTP/1.x request parser.
//!
//! `httparse` tokenizes the request line, headers, chunk sizes and trailers;
//! this module keeps the cursor between reads and enforces framing and
//! limits.
//!
//! [`Parser::feed`] is called with whatever the socket produced, however
//! small, and reports [`ParseState::Incomplete`] until a whole request has
//! accumulated. The outcome depends only on the bytes fed so far and the
//! parser's own cursor, never on how they were split.
//!
//! ```text
//!  feed(bytes) ─▶ Head ──blank line──▶ Fixed(len) ──len bytes──▶ Complete
//!                   │                                              ▲
//!                   └──chunked──▶ Size ⇄ Data ─0─▶ Trailer ─blank──┘
//! ```
//!
//! Memory is bounded by [`Limits`]: the header section may not exceed
//! `max_header_size`, the body may not exceed `max_body_size`, whether it is
//! announced with `Content-Length` or accumulated chunk by chunk.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::method::Method;
use crate::request::{decode_pairs, Request, Version};
use crate::response::Response;
use crate::Status;

/// Longest accepted chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 1024;

/// Header lines tokenized per request, and per chunked trailer section.
const MAX_HEADERS: usize = 100;

/// Size limits applied while parsing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Limits {
    /// Request line plus headers, and separately the chunked trailers.
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_header_size: 8 * 1024, max_body_size: 1024 * 1024 }
    }
}

/// Result of one [`Parser::feed`] call.
#[derive(Debug, PartialEq)]
pub enum ParseState {
    Incomplete,
    Complete(Request),
    Invalid(ParseError),
}

/// Why a byte stream is not an acceptable request. Each variant maps to the
/// status sent back before the connection is closed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    RequestLine,

    #[error("unsupported method `{0}`")]
    UnknownMethod(String),

    #[error("unsupported HTTP version")]
    Version,

    #[error("malformed header line")]
    Header,

    #[error("header section exceeds {0} bytes")]
    HeadersTooLarge(usize),

    #[error("invalid content-length")]
    ContentLength,

    #[error("both transfer-encoding and content-length present")]
    AmbiguousLength,

    #[error("unsupported transfer-encoding")]
    TransferEncoding,

    #[error("malformed chunk")]
    Chunk,

    #[error("body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl ParseError {
    pub fn status(&self) -> Status {
        match self {
            Self::UnknownMethod(_) => Status::METHOD_NOT_ALLOWED,
            Self::Version => Status::HTTP_VERSION_NOT_SUPPORTED,
            Self::HeadersTooLarge(_) => Status::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::TransferEncoding => Status::NOT_IMPLEMENTED,
            Self::BodyTooLarge(_) => Status::PAYLOAD_TOO_LARGE,
            Self::RequestLine
            | Self::Header
            | Self::ContentLength
            | Self::AmbiguousLength
            | Self::Chunk => Status::BAD_REQUEST,
        }
    }

    /// Best-effort response for a request that could not be parsed.
    pub(crate) fn to_response(&self) -> Response {
        Response::builder().status(self.status()).text(self.to_string())
    }
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// Request line and headers, waiting for their body.
#[derive(Debug)]
struct Head {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    version: Version,
    headers: HeaderMap,
}

impl Head {
    fn into_request(self, body: Bytes) -> Request {
        Request {
            method: self.method,
            path: self.path,
            query: self.query,
            version: self.version,
            headers: self.headers,
            body,
        }
    }
}

#[derive(Debug)]
enum Cursor {
    Head,
    Fixed { head: Head, len: usize },
    Chunked { head: Head, body: BytesMut, step: Chunk },
    Failed(ParseError),
}

#[derive(Clone, Copy, Debug)]
enum Chunk {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

enum ChunkProgress {
    Pending(Chunk),
    Next(Chunk),
    Done,
}

/// Incremental request parser for one connection.
///
/// Bytes beyond the end of a complete request stay buffered; calling
/// [`feed`](Parser::feed) with an empty slice continues with them, which is
/// how pipelined requests are picked up. Once [`ParseState::Invalid`] has
/// been returned the parser keeps returning it.
#[derive(Debug)]
pub struct Parser {
    buf: BytesMut,
    cursor: Cursor,
    limits: Limits,
}

impl Parser {
    pub fn new(limits: Limits) -> Self {
        Self { buf: BytesMut::new(), cursor: Cursor::Head, limits }
    }

    /// Appends `bytes` and parses as far as the buffered data allows.
    pub fn feed(&mut self, bytes: &[u8]) -> ParseState {
        if let Cursor::Failed(e) = &self.cursor {
            return ParseState::Invalid(e.clone());
        }
        self.buf.extend_from_slice(bytes);

        match self.advance() {
            Ok(Some(req)) => ParseState::Complete(req),
            Ok(None) => ParseState::Incomplete,
            Err(e) => {
                self.buf = BytesMut::new();
                self.cursor = Cursor::Failed(e.clone());
                ParseState::Invalid(e)
            }
        }
    }

    /// `true` between requests: nothing of the next request has arrived.
    pub fn is_idle(&self) -> bool {
        matches!(self.cursor, Cursor::Head) && self.buf.is_empty()
    }

    fn advance(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            let next = match std::mem::replace(&mut self.cursor, Cursor::Head) {
                Cursor::Head => match self.take_head()? {
                    Some(head) => framing(head, &self.limits)?,
                    None => return Ok(None),
                },
                Cursor::Fixed { head, len } => {
                    if self.buf.len() < len {
                        self.cursor = Cursor::Fixed { head, len };
                        return Ok(None);
                    }
                    let body = self.buf.split_to(len).freeze();
                    return Ok(Some(head.into_request(body)));
                }
                Cursor::Chunked { head, mut body, step } => {
                    match self.chunk_step(&mut body, step)? {
                        ChunkProgress::Pending(step) => {
                            self.cursor = Cursor::Chunked { head, body, step };
                            return Ok(None);
                        }
                        ChunkProgress::Next(step) => Cursor::Chunked { head, body, step },
                        ChunkProgress::Done => return Ok(Some(head.into_request(body.freeze()))),
                    }
                }
                Cursor::Failed(e) => return Err(e),
            };
            self.cursor = next;
        }
    }

    /// Splits off and parses the header section once its blank line is
    /// buffered.
    fn take_head(&mut self) -> Result<Option<Head>, ParseError> {
        // RFC 9112 §2.2: ignore empty lines before the request line.
        while self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
        }

        let max = self.limits.max_header_size;
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut slots);
        let (len, head) = match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) if len > max => return Err(ParseError::HeadersTooLarge(max)),
            Ok(httparse::Status::Complete(len)) => (len, head_from(&parsed)?),
            Ok(httparse::Status::Partial) if self.buf.len() > max => {
                return Err(ParseError::HeadersTooLarge(max));
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(head_error(e, max)),
        };
        self.buf.advance(len);
        Ok(Some(head))
    }

    fn chunk_step(&mut self, body: &mut BytesMut, step: Chunk) -> Result<ChunkProgress, ParseError> {
        match step {
            Chunk::Size => {
                let (len, size) = match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete(found)) => found,
                    Ok(httparse::Status::Partial) if self.buf.len() > MAX_CHUNK_LINE => {
                        return Err(ParseError::Chunk);
                    }
                    Ok(httparse::Status::Partial) => return Ok(ChunkProgress::Pending(step)),
                    Err(_) => return Err(ParseError::Chunk),
                };
                if len > MAX_CHUNK_LINE {
                    return Err(ParseError::Chunk);
                }
                self.buf.advance(len);

                let max = self.limits.max_body_size;
                let size = usize::try_from(size)
                    .ok()
                    .filter(|size| body.len().checked_add(*size).is_some_and(|total| total <= max))
                    .ok_or(ParseError::BodyTooLarge(max))?;
                Ok(ChunkProgress::Next(if size == 0 { Chunk::Trailer } else { Chunk::Data(size) }))
            }
            Chunk::Data(left) => {
                if self.buf.is_empty() {
                    return Ok(ChunkProgress::Pending(step));
                }
                let take = left.min(self.buf.len());
                body.extend_from_slice(&self.buf.split_to(take));
                if take < left {
                    return Ok(ChunkProgress::Pending(Chunk::Data(left - take)));
                }
                Ok(ChunkProgress::Next(Chunk::DataEnd))
            }
            Chunk::DataEnd => {
                if self.buf.len() < 2 {
                    return Ok(ChunkProgress::Pending(step));
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err(ParseError::Chunk);
                }
                self.buf.advance(2);
                Ok(ChunkProgress::Next(Chunk::Size))
            }
            Chunk::Trailer => {
                // trailer fields are read and dropped
                let max = self.limits.max_header_size;
                let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let len = match httparse::parse_headers(&self.buf, &mut slots) {
                    Ok(httparse::Status::Complete((len, _))) => len,
                    Ok(httparse::Status::Partial) if self.buf.len() > max => {
                        return Err(ParseError::HeadersTooLarge(max));
                    }
                    Ok(httparse::Status::Partial) => return Ok(ChunkProgress::Pending(step)),
                    Err(e) => return Err(head_error(e, max)),
                };
                if len > max {
                    return Err(ParseError::HeadersTooLarge(max));
                }
                self.buf.advance(len);
                Ok(ChunkProgress::Done)
            }
        }
    }
}

// ── Head parsing ──────────────────────────────────────────────────────────────

/// Converts what `httparse` tokenized into an owned [`Head`].
fn head_from(parsed: &httparse::Request<'_, '_>) -> Result<Head, ParseError> {
    let (Some(method), Some(target), Some(version)) = (parsed.method, parsed.path, parsed.version) else {
        return Err(ParseError::RequestLine);
    };

    let method: Method = method
        .parse()
        .map_err(|e: crate::method::UnknownMethod| ParseError::UnknownMethod(e.0))?;

    let origin_form = target.starts_with('/');
    let asterisk_form = target == "*" && method == Method::Options;
    if !(origin_form || asterisk_form) || target.bytes().any(|b| !b.is_ascii_graphic()) {
        return Err(ParseError::RequestLine);
    }

    let version = match version {
        0 => Version::Http10,
        1 => Version::Http11,
        _ => return Err(ParseError::Version),
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| ParseError::Header)?;
        let value = HeaderValue::from_bytes(header.value.trim_ascii()).map_err(|_| ParseError::Header)?;
        headers.append(name, value);
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    Ok(Head {
        method,
        path: path.to_owned(),
        query: decode_pairs(query.as_bytes()),
        version,
        headers,
    })
}

fn head_error(e: httparse::Error, max_header_size: usize) -> ParseError {
    match e {
        httparse::Error::HeaderName | httparse::Error::HeaderValue => ParseError::Header,
        httparse::Error::TooManyHeaders => ParseError::HeadersTooLarge(max_header_size),
        httparse::Error::Version => ParseError::Version,
        _ => ParseError::RequestLine,
    }
}

/// Decides how the body is delimited (RFC 9112 §6.3).
fn framing(head: Head, limits: &Limits) -> Result<Cursor, ParseError> {
    if head.headers.contains_key(TRANSFER_ENCODING) {
        if head.headers.contains_key(CONTENT_LENGTH) {
            return Err(ParseError::AmbiguousLength);
        }
        let mut codings = Vec::new();
        for value in head.headers.get_all(TRANSFER_ENCODING) {
            let value = value.to_str().map_err(|_| ParseError::TransferEncoding)?;
            codings.extend(value.split(',').map(str::trim).filter(|c| !c.is_empty()));
        }
        // only plain chunked framing is decoded
        return match codings.as_slice() {
            [only] if only.eq_ignore_ascii_case("chunked") => Ok(Cursor::Chunked {
                head,
                body: BytesMut::new(),
                step: Chunk::Size,
            }),
            _ => Err(ParseError::TransferEncoding),
        };
    }

    let mut len: Option<usize> = None;
    for value in head.headers.get_all(CONTENT_LENGTH) {
        for part in value.to_str().map_err(|_| ParseError::ContentLength)?.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::ContentLength);
            }
            let n: usize = part.parse().map_err(|_| ParseError::BodyTooLarge(limits.max_body_size))?;
            match len {
                Some(prev) if prev != n => return Err(ParseError::ContentLength),
                _ => len = Some(n),
            }
        }
    }

    let len = len.unwrap_or(0);
    if len > limits.max_body_size {
        return Err(ParseError::BodyTooLarge(limits.max_body_size));
    }
    Ok(Cursor::Fixed { head, len })
}
