//! Inbound requests, parsed from the wire with [`httparse`] or built in code.

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// An HTTP request as seen by a [`Backend`](crate::proxy::Backend).
///
/// Requests are cheap to clone (the body is a [`Bytes`]); the change poller
/// keeps a clone of the request that started it and replays it on every
/// attempt.
///
/// # Examples
///
/// ```
/// use sponge::http::{Method, Request};
///
/// let request = Request::new(Method::Get, "/status?verbose=1").header("Host", "api");
/// assert_eq!(request.path(), "/status");
/// assert_eq!(request.query_string(), Some("verbose=1"));
/// assert_eq!(request.target(), "/status?verbose=1");
///
/// let raw = b"GET /status HTTP/1.1\r\nHost: api\r\n\r\n";
/// let (parsed, _offset) = Request::parse(raw).unwrap();
/// assert_eq!(parsed.path(), "/status");
/// assert_eq!(parsed.headers().get("host"), Some("api"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we accept per request.
    const MAX_HEADERS: usize = 64;

    /// Builds an HTTP/1.1 request for `target` (a path with optional query).
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path,
            query,
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parses the head of an HTTP/1.1 request from `buf`.
    ///
    /// Returns the request and the offset where the body starts. The body
    /// itself is attached later with [`with_body`](Self::with_body), once
    /// `Content-Length` bytes have arrived.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] if the header block is not complete yet.
    /// - [`RequestError::Parse`] if the data is malformed.
    /// - [`RequestError::MissingField`] if method, path or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw.method {
            Some(token) => match token.parse::<Method>() {
                Ok(method) => method,
                Err(never) => match never {},
            },
            None => return Err(RequestError::MissingField { field: "method" }),
        };
        let target = raw.path.ok_or(RequestError::MissingField { field: "path" })?;
        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let (path, query) = split_target(target);
        Ok((
            Self {
                method,
                path,
                query,
                version,
                headers: header_map,
                body: Bytes::new(),
            },
            body_offset,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the path and query as they appeared on the request line.
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should stay open after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}
