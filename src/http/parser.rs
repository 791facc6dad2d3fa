//! Incremental HTTP/1.x request parser.
//!
//! The parser is a resumable byte-stream state machine: `parse` may be
//! called with any prefix of the request, consumes what it can, reports how
//! many bytes it used this call, and picks up exactly where it left off on
//! the next call. Bytes beyond a fully parsed request (pipelined requests)
//! are never consumed.

use thiserror::Error;

use crate::http::request::{Request, RequestBuilder};
use crate::http::response::StatusCode;

/// Errors detected while parsing a request; each maps to the HTTP status
/// the connection answers with before closing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid token byte 0x{byte:02x} in {context}")]
    InvalidToken { byte: u8, context: &'static str },
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("duplicate header: {0}")]
    DuplicateHeader(String),
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("missing Host header")]
    MissingHost,
    #[error("unsupported HTTP major version {major}")]
    UnsupportedVersion { major: u32 },
    #[error("request body exceeds the allowed size")]
    PayloadTooLarge,
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
}

impl ParseError {
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::UnsupportedVersion { .. } => StatusCode::HttpVersionNotSupported,
            ParseError::PayloadTooLarge => StatusCode::PayloadTooLarge,
            ParseError::HeadTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            _ => StatusCode::BadRequest,
        }
    }
}

/// Progress report from a `parse` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are needed.
    Incomplete,
    /// All headers are in; no body byte has been consumed yet. Reported at
    /// most once per request, and only for requests that carry a body, so
    /// the upload policy can run before the body is read.
    HeadersComplete,
    /// A full request is available via [`RequestParser::take_request`].
    Complete,
}

/// Ceiling on request line plus headers. A single connection must not be
/// able to grow the read buffer without limit.
const MAX_HEAD_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestMethod,
    RequestUri,
    VersionHttp,
    VersionMajor,
    VersionMinor,
    RequestLineLf,
    HeaderName,
    HeaderValue,
    HeaderValueLf,
    HeaderNameOrContinuation,
    HeadersEndLf,
    Content,
    Complete,
}

/// RFC 2616 separators; together with CTLs these delimit tokens.
fn is_token_byte(b: u8) -> bool {
    if b < 32 || b == 127 {
        return false;
    }
    !matches!(
        b,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

/// Per-connection incremental request parser.
pub struct RequestParser {
    state: State,
    builder: RequestBuilder,
    name_buf: String,
    value_buf: String,
    // Space/tab run inside the current header value; collapsed to one
    // space when the next visible byte arrives, dropped at end of line.
    pending_space: bool,
    http_literal_pos: usize,
    version_major: u32,
    version_minor: u32,
    version_digits: u32,
    head: Option<Request>,
    headers_reported: bool,
    head_bytes: usize,
    content_remaining: usize,
    body_limit: Option<usize>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: State::RequestMethod,
            builder: RequestBuilder::new(),
            name_buf: String::new(),
            value_buf: String::new(),
            pending_space: false,
            http_literal_pos: 0,
            version_major: 0,
            version_minor: 0,
            version_digits: 0,
            head: None,
            headers_reported: false,
            head_bytes: 0,
            content_remaining: 0,
            body_limit: None,
        }
    }

    /// Ready the parser for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = State::RequestMethod;
        self.builder.reset();
        self.name_buf.clear();
        self.value_buf.clear();
        self.pending_space = false;
        self.http_literal_pos = 0;
        self.version_major = 0;
        self.version_minor = 0;
        self.version_digits = 0;
        self.head = None;
        self.headers_reported = false;
        self.head_bytes = 0;
        self.content_remaining = 0;
        self.body_limit = None;
    }

    /// Available once all headers have been parsed.
    pub fn head(&self) -> Option<&Request> {
        self.head.as_ref()
    }

    /// Caps the body size. Fails immediately when the declared
    /// `Content-Length` already exceeds the cap, before any body byte is
    /// consumed.
    pub fn set_body_limit(&mut self, limit: Option<usize>) -> Result<(), ParseError> {
        self.body_limit = limit;
        if let Some(max) = limit {
            if self.state == State::Content && self.content_remaining > max {
                return Err(ParseError::PayloadTooLarge);
            }
        }
        Ok(())
    }

    /// `None` unless the last `parse` call reported
    /// [`ParseStatus::Complete`].
    pub fn take_request(&mut self) -> Option<Request> {
        if self.state != State::Complete {
            return None;
        }
        let mut request = self.head.take()?;
        request.body = self.builder.take_body();
        Some(request)
    }

    /// Feeds bytes to the state machine. Returns the parse status and the
    /// number of bytes consumed by this call; the caller must drop exactly
    /// that many bytes from the front of its buffer.
    pub fn parse(&mut self, buf: &[u8]) -> Result<(ParseStatus, usize), ParseError> {
        let mut i = 0;

        while i < buf.len() {
            let b = buf[i];
            if !matches!(self.state, State::Content | State::Complete) {
                self.head_bytes += 1;
                if self.head_bytes > MAX_HEAD_BYTES {
                    return Err(ParseError::HeadTooLarge);
                }
            }
            match self.state {
                State::RequestMethod => {
                    if b == b' ' {
                        if self.builder.method_is_empty() {
                            return Err(ParseError::MalformedRequestLine);
                        }
                        self.state = State::RequestUri;
                    } else if is_token_byte(b) {
                        self.builder.push_method_byte(b);
                    } else {
                        return Err(ParseError::InvalidToken { byte: b, context: "method" });
                    }
                    i += 1;
                }

                State::RequestUri => {
                    match b {
                        b' ' => {
                            if self.builder.uri_is_empty() {
                                return Err(ParseError::MalformedRequestLine);
                            }
                            self.state = State::VersionHttp;
                            self.http_literal_pos = 0;
                        }
                        // Escaped on the fly: non-conforming clients send
                        // these raw, and they corrupt downstream parsing.
                        b'|' => self.builder.push_uri_str("%7C"),
                        b'^' => self.builder.push_uri_str("%5E"),
                        b'`' => self.builder.push_uri_str("%60"),
                        _ if b < 32 || b == 127 => {
                            return Err(ParseError::InvalidToken { byte: b, context: "uri" });
                        }
                        _ => self.builder.push_uri_byte(b),
                    }
                    i += 1;
                }

                State::VersionHttp => {
                    const LITERAL: &[u8] = b"HTTP/";
                    if b != LITERAL[self.http_literal_pos] {
                        return Err(ParseError::MalformedRequestLine);
                    }
                    self.http_literal_pos += 1;
                    if self.http_literal_pos == LITERAL.len() {
                        self.state = State::VersionMajor;
                        self.version_major = 0;
                        self.version_digits = 0;
                    }
                    i += 1;
                }

                State::VersionMajor => {
                    match b {
                        b'0'..=b'9' => {
                            // Leading zeros fold away naturally.
                            self.version_major = self
                                .version_major
                                .checked_mul(10)
                                .and_then(|v| v.checked_add(u32::from(b - b'0')))
                                .ok_or(ParseError::MalformedRequestLine)?;
                            self.version_digits += 1;
                        }
                        b'.' => {
                            if self.version_digits == 0 {
                                return Err(ParseError::MalformedRequestLine);
                            }
                            self.state = State::VersionMinor;
                            self.version_minor = 0;
                            self.version_digits = 0;
                        }
                        _ => return Err(ParseError::MalformedRequestLine),
                    }
                    i += 1;
                }

                State::VersionMinor => {
                    match b {
                        b'0'..=b'9' => {
                            self.version_minor = self
                                .version_minor
                                .checked_mul(10)
                                .and_then(|v| v.checked_add(u32::from(b - b'0')))
                                .ok_or(ParseError::MalformedRequestLine)?;
                            self.version_digits += 1;
                        }
                        b'\r' => {
                            if self.version_digits == 0 {
                                return Err(ParseError::MalformedRequestLine);
                            }
                            self.builder.set_version(self.version_major, self.version_minor);
                            self.state = State::RequestLineLf;
                        }
                        _ => return Err(ParseError::MalformedRequestLine),
                    }
                    i += 1;
                }

                State::RequestLineLf => {
                    if b != b'\n' {
                        return Err(ParseError::MalformedRequestLine);
                    }
                    self.state = State::HeaderName;
                    self.name_buf.clear();
                    i += 1;
                }

                State::HeaderName => {
                    if b == b':' {
                        if self.name_buf.is_empty() {
                            return Err(ParseError::MalformedHeader);
                        }
                        self.state = State::HeaderValue;
                        self.value_buf.clear();
                        self.pending_space = false;
                    } else if b == b'\r' && self.name_buf.is_empty() {
                        // Blank line right after the request line.
                        self.state = State::HeadersEndLf;
                    } else if is_token_byte(b) {
                        self.name_buf.push(b.to_ascii_lowercase() as char);
                    } else {
                        return Err(ParseError::InvalidToken { byte: b, context: "header name" });
                    }
                    i += 1;
                }

                State::HeaderValue => {
                    match b {
                        b'\r' => self.state = State::HeaderValueLf,
                        b' ' | b'\t' => {
                            // Collapse interior runs; drop leading/trailing.
                            if !self.value_buf.is_empty() {
                                self.pending_space = true;
                            }
                        }
                        _ if b < 32 || b == 127 => return Err(ParseError::MalformedHeader),
                        _ => {
                            if self.pending_space {
                                self.value_buf.push(' ');
                                self.pending_space = false;
                            }
                            self.value_buf.push(b as char);
                        }
                    }
                    i += 1;
                }

                State::HeaderValueLf => {
                    if b != b'\n' {
                        return Err(ParseError::MalformedHeader);
                    }
                    self.state = State::HeaderNameOrContinuation;
                    i += 1;
                }

                State::HeaderNameOrContinuation => {
                    match b {
                        b' ' | b'\t' => {
                            // Folded continuation of the previous value.
                            if !self.value_buf.is_empty() {
                                self.pending_space = true;
                            }
                            self.state = State::HeaderValue;
                        }
                        b'\r' => {
                            self.commit_header()?;
                            self.state = State::HeadersEndLf;
                        }
                        _ if is_token_byte(b) => {
                            self.commit_header()?;
                            self.name_buf.clear();
                            self.name_buf.push(b.to_ascii_lowercase() as char);
                            self.state = State::HeaderName;
                        }
                        _ => {
                            return Err(ParseError::InvalidToken { byte: b, context: "header name" });
                        }
                    }
                    i += 1;
                }

                State::HeadersEndLf => {
                    if b != b'\n' {
                        return Err(ParseError::MalformedHeader);
                    }
                    i += 1;

                    let head = self.builder.build_head()?;
                    let content_length = head.content_length();
                    self.head = Some(head);

                    if content_length > 0 {
                        if let Some(max) = self.body_limit {
                            if content_length > max {
                                return Err(ParseError::PayloadTooLarge);
                            }
                        }
                        self.content_remaining = content_length;
                        self.state = State::Content;
                        if !self.headers_reported {
                            self.headers_reported = true;
                            return Ok((ParseStatus::HeadersComplete, i));
                        }
                    } else {
                        self.state = State::Complete;
                        return Ok((ParseStatus::Complete, i));
                    }
                }

                State::Content => {
                    let take = self.content_remaining.min(buf.len() - i);
                    self.builder.extend_body(&buf[i..i + take]);
                    i += take;
                    self.content_remaining -= take;
                    if self.content_remaining == 0 {
                        self.state = State::Complete;
                        return Ok((ParseStatus::Complete, i));
                    }
                }

                State::Complete => {
                    // Pipelined bytes stay in the caller's buffer.
                    return Ok((ParseStatus::Complete, 0));
                }
            }
        }

        if self.state == State::Complete {
            Ok((ParseStatus::Complete, i))
        } else {
            Ok((ParseStatus::Incomplete, i))
        }
    }

    fn commit_header(&mut self) -> Result<(), ParseError> {
        let name = std::mem::take(&mut self.name_buf);
        let value = std::mem::take(&mut self.value_buf);
        self.pending_space = false;
        self.builder.add_header(name, value)
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}
