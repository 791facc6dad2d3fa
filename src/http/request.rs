use std::collections::HashMap;

use crate::http::parser::ParseError;

/// HTTP request methods.
///
/// Any RFC 2616 token is accepted by the parser; the common verbs get a
/// dedicated variant and everything else is carried through as `Other` so
/// handlers can still see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    /// Any other token (e.g. extension methods).
    Other(String),
}

impl Method {
    /// Parses an HTTP method token (case-sensitive, per the RFC).
    pub fn from_token(s: &str) -> Self {
        match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::Other(s) => s,
        }
    }
}

/// HTTP protocol version as parsed from the request line.
///
/// Leading zeros in the digit runs are stripped by the parser, so
/// `HTTP/01.1` compares equal to `HTTP/1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    /// True for HTTP/1.1 and any later minor revision.
    pub fn at_least_1_1(&self) -> bool {
        self.major > 1 || (self.major == 1 && self.minor >= 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// A parsed HTTP request.
///
/// Immutable once built. Header names are normalized to lowercase; repeated
/// occurrences of repeatable headers are joined with `", "` by the parser.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// The raw request URI, with `|`, `^` and backtick percent-encoded.
    pub uri: String,
    pub version: Version,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    /// Retrieves a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// The `Host` header without any `:port` suffix, lowercased.
    pub fn host(&self) -> Option<String> {
        self.header("host")
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
    }

    /// The declared `Content-Length`, or 0 when absent.
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Whether the client wants the connection kept open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
    /// defaults to close unless `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version.at_least_1_1(),
        }
    }

    /// Copy of this request with one header replaced or added.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

/// Accumulates request fields as the parser advances; `build` runs the
/// checks that only make sense once all headers have been seen.
#[derive(Debug)]
pub struct RequestBuilder {
    method: String,
    uri: String,
    version: Option<Version>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: String::new(),
            uri: String::new(),
            version: None,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn push_method_byte(&mut self, b: u8) {
        self.method.push(b as char);
    }

    pub fn method_is_empty(&self) -> bool {
        self.method.is_empty()
    }

    pub fn uri_is_empty(&self) -> bool {
        self.uri.is_empty()
    }

    pub fn push_uri_byte(&mut self, b: u8) {
        self.uri.push(b as char);
    }

    pub fn push_uri_str(&mut self, s: &str) {
        self.uri.push_str(s);
    }

    pub fn set_version(&mut self, major: u32, minor: u32) {
        self.version = Some(Version { major, minor });
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    /// Stores a completed header. `name` must already be lowercased.
    ///
    /// Repeats of repeatable headers are joined with `", "`; a repeat of a
    /// non-repeatable header (`Host`, `Content-Length`) is a hard error.
    pub fn add_header(&mut self, name: String, value: String) -> Result<(), ParseError> {
        use std::collections::hash_map::Entry;
        match self.headers.entry(name) {
            Entry::Vacant(e) => {
                e.insert(value);
                Ok(())
            }
            Entry::Occupied(mut e) => {
                if matches!(e.key().as_str(), "host" | "content-length") {
                    return Err(ParseError::DuplicateHeader(e.key().clone()));
                }
                let joined = e.get_mut();
                joined.push_str(", ");
                joined.push_str(&value);
                Ok(())
            }
        }
    }

    pub fn extend_body(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Finalizes the head (no body yet). Enforces the rules that apply once
    /// all headers are known: a valid `Content-Length`, `Host` on HTTP/1.1+,
    /// and a supported protocol major version.
    pub fn build_head(&self) -> Result<Request, ParseError> {
        let version = self.version.ok_or(ParseError::MalformedRequestLine)?;
        if version.major > 1 {
            return Err(ParseError::UnsupportedVersion { major: version.major });
        }
        if let Some(v) = self.headers.get("content-length") {
            if v.parse::<usize>().is_err() {
                return Err(ParseError::InvalidContentLength);
            }
        }
        if version.at_least_1_1() && !self.headers.contains_key("host") {
            return Err(ParseError::MissingHost);
        }
        Ok(Request {
            method: Method::from_token(&self.method),
            uri: self.uri.clone(),
            version,
            headers: self.headers.clone(),
            body: Vec::new(),
        })
    }

    /// Consumes the accumulated body, leaving the builder ready for reset.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Returns the builder to its initial state without dropping the
    /// allocations it already holds.
    pub fn reset(&mut self) {
        self.method.clear();
        self.uri.clear();
        self.version = None;
        self.headers.clear();
        self.body.clear();
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
