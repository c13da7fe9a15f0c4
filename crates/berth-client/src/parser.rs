//! Incremental HTTP/1.x response parser.
//!
//! The parser is a two-phase state machine that accepts bytes in arbitrarily
//! small pieces (down to a single byte) and produces complete response units.
//! It never waits for more data than it has: whenever a unit is incomplete the
//! buffered bytes are kept and parsing resumes on the next feed.
//!
//! Supported framing:
//! ```text
//! AwaitingHeaders --(CRLFCRLF)--> 1xx/204/205/304 -------------> emit, AwaitingHeaders
//!                              \-> AwaitingBody
//!                                    chunked:   <hex>CRLF<data>CRLF   emit per chunk
//!                                               0CRLF CRLF            end event, AwaitingHeaders
//!                                    identity:  Content-Length bytes  emit, AwaitingHeaders
//!                                               ... CRLFCRLF          emit, AwaitingHeaders
//! ```
//!
//! Chunked bodies are delivered one unit per chunk, each carrying the same
//! status and headers, followed by [`ParserEvent::ChunkedEnd`] once the
//! zero-length chunk arrives. [`ResponseParser::feed`] reports only the
//! units; [`ResponseParser::feed_events`] also reports the end of each
//! chunked body so callers can put it back together.
//!
//! A multi-byte character split across two chunks is carried over: the first
//! unit ends before the character and the next one starts with it.

use std::collections::HashMap;
use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

/// Every status line starts with this literal
const HTTP_PREFIX: &[u8] = b"HTTP/";

const CRLF: &[u8] = b"\r\n";

/// Terminates the header section, and identity bodies without a length
const BLANK_LINE: &[u8] = b"\r\n\r\n";

/// Maximum size of a header section (64 KB)
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum size of a single body or chunk (16 MB)
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Longest chunk-size line accepted before giving up on finding its CRLF
const MAX_CHUNK_LINE: usize = 32;

/// Number of bytes quoted back in error messages
const ERROR_PREVIEW_LEN: usize = 64;

/// Header name to value, last write wins, names kept as received
pub type Headers = HashMap<String, String>;

/// One complete unit produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: String,
}

impl ParsedResponse {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    #[must_use]
    pub fn is_no_content(&self) -> bool {
        is_no_content(self.status_code)
    }

    /// Whether this unit is one chunk of a chunked body rather than a whole
    /// body.
    #[must_use]
    pub fn is_chunk(&self) -> bool {
        !has_no_body(self.status_code)
            && self
                .header("Transfer-Encoding")
                .is_some_and(|encoding| encoding == "chunked")
    }
}

/// What one parsing step produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// A whole response, or one chunk of a chunked body
    Response(ParsedResponse),
    /// The zero-length chunk closing a chunked body
    ChunkedEnd { status_code: u16, headers: Headers },
}

/// Errors raised while parsing the response stream
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid status line: {0:?}")]
    InvalidStatus(String),

    #[error("Invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("Invalid value for header {name}: {value:?}")]
    InvalidHeaderValue { name: String, value: String },

    #[error("Invalid chunk length: {0:?}")]
    ChunkLengthInvalid(String),

    #[error("Unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("Response is not valid UTF-8")]
    InvalidUtf8,

    #[error("Header section too large: {0} bytes (max: {MAX_HEADER_SIZE})")]
    HeadersTooLarge(usize),

    #[error("Body too large: {0} bytes (max: {MAX_BODY_SIZE})")]
    BodyTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    AwaitingHeaders,
    AwaitingBody {
        status_code: u16,
        headers: Headers,
        /// Leading bytes of a character cut off by the previous chunk
        carry: Vec<u8>,
    },
}

/// Outcome of one attempt to parse body bytes
enum Body {
    /// More bytes are needed
    Incomplete,
    /// One chunk of a chunked body; the body continues
    Chunk(BytesMut),
    /// The whole body of an identity response
    Complete(String),
    /// Zero-length chunk seen, the chunked body is over
    End,
}

/// Incremental response parser.
///
/// Not internally synchronized: a single owner must drive it, one feed at a
/// time. The same state machine is exposed as a [`Decoder`] so it can also
/// run over a caller-owned buffer.
#[derive(Debug, Default)]
pub struct ResponseParser {
    phase: Phase,
    buffer: BytesMut,
    /// Where the next delimiter search resumes
    scan_from: usize,
}

impl ResponseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` to the internal buffer and emit every unit that is now
    /// complete, in stream order.
    ///
    /// Units completed before a malformed section are emitted before the
    /// error is returned. After an error the buffered bytes are discarded and
    /// the parser waits for a fresh status line.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] describing the first malformed section.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        mut emit: impl FnMut(ParsedResponse),
    ) -> Result<(), ParseError> {
        self.feed_events(bytes, |event| {
            if let ParserEvent::Response(response) = event {
                emit(response);
            }
        })
    }

    /// Like [`feed`](Self::feed), but also reports the end of every chunked
    /// body.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] describing the first malformed section.
    pub fn feed_events(
        &mut self,
        bytes: &[u8],
        mut emit: impl FnMut(ParserEvent),
    ) -> Result<(), ParseError> {
        self.buffer.extend_from_slice(bytes);

        let mut buffer = std::mem::take(&mut self.buffer);
        let result = loop {
            match self.decode(&mut buffer) {
                Ok(Some(event)) => emit(event),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.buffer = buffer;
        result
    }

    /// Drop any partially received unit and return to the initial state.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() || self.is_mid_response() {
            debug!(
                discarded = self.buffer.len(),
                "Discarding incomplete response data"
            );
        }
        self.buffer.clear();
        self.phase = Phase::AwaitingHeaders;
        self.scan_from = 0;
    }

    /// Number of bytes held back waiting for more data.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a status line has been read but its body is not finished yet.
    #[must_use]
    pub fn is_mid_response(&self) -> bool {
        matches!(self.phase, Phase::AwaitingBody { .. })
    }

    fn advance(&mut self, src: &mut BytesMut) -> Result<Option<ParserEvent>, ParseError> {
        loop {
            match &mut self.phase {
                Phase::AwaitingHeaders => {
                    let Some((status_code, headers)) = parse_head(src, &mut self.scan_from)?
                    else {
                        return Ok(None);
                    };

                    if has_no_body(status_code) {
                        trace!(status_code, "Response without body, skipping body phase");
                        return Ok(Some(ParserEvent::Response(ParsedResponse {
                            status_code,
                            headers,
                            body: String::new(),
                        })));
                    }

                    self.phase = Phase::AwaitingBody {
                        status_code,
                        headers,
                        carry: Vec::new(),
                    };
                }
                Phase::AwaitingBody {
                    status_code,
                    headers,
                    carry,
                } => match parse_body(src, headers, &mut self.scan_from)? {
                    Body::Incomplete => return Ok(None),
                    Body::Chunk(content) => {
                        let body = chunk_text(carry, &content)?;
                        if body.is_empty() {
                            continue;
                        }
                        return Ok(Some(ParserEvent::Response(ParsedResponse {
                            status_code: *status_code,
                            headers: headers.clone(),
                            body,
                        })));
                    }
                    Body::Complete(body) => {
                        let response = ParsedResponse {
                            status_code: *status_code,
                            headers: std::mem::take(headers),
                            body,
                        };
                        self.phase = Phase::AwaitingHeaders;
                        return Ok(Some(ParserEvent::Response(response)));
                    }
                    Body::End => {
                        if !carry.is_empty() {
                            return Err(ParseError::InvalidUtf8);
                        }
                        let event = ParserEvent::ChunkedEnd {
                            status_code: *status_code,
                            headers: std::mem::take(headers),
                        };
                        self.phase = Phase::AwaitingHeaders;
                        return Ok(Some(event));
                    }
                },
            }
        }
    }
}

impl Decoder for ResponseParser {
    type Item = ParserEvent;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let result = self.advance(src);
        if result.is_err() {
            src.clear();
            self.phase = Phase::AwaitingHeaders;
            self.scan_from = 0;
        }
        result
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }

        // An unterminated unit is never delivered
        if !src.is_empty() || self.is_mid_response() {
            debug!(
                discarded = src.len(),
                "Stream ended inside a response, discarding it"
            );
        }
        src.clear();
        self.phase = Phase::AwaitingHeaders;
        self.scan_from = 0;
        Ok(None)
    }
}

fn is_no_content(status_code: u16) -> bool {
    matches!(status_code, 204 | 205)
}

/// Statuses that never carry a body, whatever the headers say.
fn has_no_body(status_code: u16) -> bool {
    is_no_content(status_code) || status_code == 304 || (100..200).contains(&status_code)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Search `src` for `needle`, skipping the bytes an earlier failed search
/// already covered.
///
/// `resume` is cleared on a hit; the caller consumes up to the delimiter.
fn find_from(src: &[u8], needle: &[u8], resume: &mut usize) -> Option<usize> {
    let start = (*resume).min(src.len());
    if let Some(position) = find(&src[start..], needle) {
        *resume = 0;
        return Some(start + position);
    }
    // A delimiter may straddle the end of what has arrived so far
    *resume = src.len().saturating_sub(needle.len() - 1);
    None
}

fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(ERROR_PREVIEW_LEN);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn into_text(bytes: BytesMut) -> Result<String, ParseError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::InvalidUtf8)
}

/// Decode one chunk, prefixed by whatever the previous chunk left in
/// `carry`. An incomplete character at the end goes back into `carry`.
fn chunk_text(carry: &mut Vec<u8>, content: &[u8]) -> Result<String, ParseError> {
    let mut bytes = std::mem::take(carry);
    bytes.extend_from_slice(content);

    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(e) if e.utf8_error().error_len().is_none() => {
            let valid = e.utf8_error().valid_up_to();
            let mut bytes = e.into_bytes();
            *carry = bytes.split_off(valid);
            trace!(carried = carry.len(), "Character continues in next chunk");
            String::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)
        }
        Err(_) => Err(ParseError::InvalidUtf8),
    }
}

/// Parse a status line and header block once the blank line has arrived.
fn parse_head(
    src: &mut BytesMut,
    scan_from: &mut usize,
) -> Result<Option<(u16, Headers)>, ParseError> {
    // Blank lines between responses, or the terminator after an identity body
    while src.starts_with(CRLF) {
        src.advance(CRLF.len());
        *scan_from = 0;
    }
    if src.as_ref() == b"\r" {
        return Ok(None);
    }

    let checked = src.len().min(HTTP_PREFIX.len());
    if src[..checked] != HTTP_PREFIX[..checked] {
        return Err(ParseError::InvalidStatus(preview(src)));
    }

    let Some(end) = find_from(src, BLANK_LINE, scan_from) else {
        if src.len() > MAX_HEADER_SIZE {
            return Err(ParseError::HeadersTooLarge(src.len()));
        }
        return Ok(None);
    };

    let head = src.split_to(end);
    src.advance(BLANK_LINE.len());

    let head = std::str::from_utf8(&head).map_err(|_| ParseError::InvalidUtf8)?;
    let mut lines = head.split("\r\n");
    let status_code = parse_status_line(lines.next().unwrap_or_default())?;

    let mut headers = Headers::new();
    for line in lines {
        let parts: Vec<&str> = line.split(": ").collect();
        let [name, value] = parts.as_slice() else {
            return Err(ParseError::InvalidHeader(line.to_string()));
        };
        headers.insert((*name).to_string(), (*value).to_string());
    }

    debug!(status_code, headers = headers.len(), "Parsed response head");
    Ok(Some((status_code, headers)))
}

/// `<version> <code> <reason...>`; only the code matters.
fn parse_status_line(line: &str) -> Result<u16, ParseError> {
    let mut fields = line.split_whitespace();
    let (Some(_version), Some(code)) = (fields.next(), fields.next()) else {
        return Err(ParseError::InvalidStatus(line.to_string()));
    };
    code.parse()
        .map_err(|_| ParseError::InvalidStatus(line.to_string()))
}

fn parse_body(
    src: &mut BytesMut,
    headers: &Headers,
    scan_from: &mut usize,
) -> Result<Body, ParseError> {
    let encoding = header_value(headers, "Transfer-Encoding").unwrap_or("identity");
    match encoding {
        "chunked" => parse_chunk(src, scan_from),
        "identity" => match header_value(headers, "Content-Length") {
            Some(length) => parse_sized(src, length),
            None => parse_delimited(src, scan_from),
        },
        other => Err(ParseError::UnsupportedTransferEncoding(other.to_string())),
    }
}

fn parse_chunk(src: &mut BytesMut, scan_from: &mut usize) -> Result<Body, ParseError> {
    let Some(line_end) = find_from(src, CRLF, scan_from) else {
        if src.len() > MAX_CHUNK_LINE {
            return Err(ParseError::ChunkLengthInvalid(preview(src)));
        }
        return Ok(Body::Incomplete);
    };

    let length_text = std::str::from_utf8(&src[..line_end])
        .map_err(|_| ParseError::ChunkLengthInvalid(preview(&src[..line_end])))?;
    if length_text.is_empty() || !length_text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::ChunkLengthInvalid(length_text.to_string()));
    }
    let length = usize::from_str_radix(length_text, 16)
        .map_err(|_| ParseError::ChunkLengthInvalid(length_text.to_string()))?;

    let content_start = line_end + CRLF.len();

    if length == 0 {
        if src.len() < content_start + CRLF.len() {
            return Ok(Body::Incomplete);
        }
        src.advance(content_start + CRLF.len());
        trace!("Chunked body complete");
        return Ok(Body::End);
    }

    if length > MAX_BODY_SIZE {
        return Err(ParseError::BodyTooLarge(length));
    }

    let frame_end = content_start + length + CRLF.len();
    if src.len() < frame_end {
        src.reserve(frame_end - src.len());
        return Ok(Body::Incomplete);
    }

    src.advance(content_start);
    let content = src.split_to(length);
    src.advance(CRLF.len());

    trace!(length, "Parsed body chunk");
    Ok(Body::Chunk(content))
}

fn parse_sized(src: &mut BytesMut, length_text: &str) -> Result<Body, ParseError> {
    let length: usize =
        length_text
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidHeaderValue {
                name: "Content-Length".to_string(),
                value: length_text.to_string(),
            })?;

    if length > MAX_BODY_SIZE {
        return Err(ParseError::BodyTooLarge(length));
    }

    if src.len() < length {
        src.reserve(length - src.len());
        return Ok(Body::Incomplete);
    }

    let content = src.split_to(length);
    if src.starts_with(CRLF) {
        src.advance(CRLF.len());
    }

    Ok(Body::Complete(into_text(content)?))
}

fn parse_delimited(src: &mut BytesMut, scan_from: &mut usize) -> Result<Body, ParseError> {
    let Some(end) = find_from(src, BLANK_LINE, scan_from) else {
        if src.len() > MAX_BODY_SIZE {
            return Err(ParseError::BodyTooLarge(src.len()));
        }
        return Ok(Body::Incomplete);
    };

    let content = src.split_to(end);
    src.advance(BLANK_LINE.len());

    Ok(Body::Complete(into_text(content)?))
}
