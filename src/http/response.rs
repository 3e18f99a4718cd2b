//! Outbound responses and their HTTP/1.1 wire encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// An HTTP/1.1 response.
///
/// Cached results write themselves onto a `Response` through
/// [`CachedResult::write_to`](crate::proxy::CachedResult::write_to); failed
/// fetches are turned into one by
/// [`Backend::handle_error`](crate::proxy::Backend::handle_error). Responses
/// are `Clone` so one error response can be handed to every request that
/// waited on the same failed fetch.
///
/// # Examples
///
/// ```
/// use sponge::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok).json(r#"{"result":true}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Type: application/json\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a text body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets a raw body.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and its `Content-Type`.
    #[must_use]
    pub fn json(mut self, body: impl Into<Bytes>) -> Self {
        self.headers.set("Content-Type", "application/json");
        self.body = body.into();
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is
    /// written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_ref(&self) -> &[u8] {
        &self.body
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes the response in HTTP/1.1 wire format.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` to a non-empty body
    /// without a content type, plus `Connection` and `Content-Length`.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.headers.set("Connection", connection);

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + content_length);
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(format!("Content-Length: {content_length}\r\n\r\n").as_bytes());
        buf.put(self.body);

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn text_body_gets_default_content_type() {
        let s = to_string(Response::new(StatusCode::Ok).body("Hello").into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn json_sets_content_type_once() {
        let r = Response::new(StatusCode::Ok)
            .header("Content-Type", "text/html")
            .json("{}");
        assert_eq!(r.headers().get("content-type"), Some("application/json"));
        assert_eq!(r.headers().len(), 1);
        assert_eq!(r.body_ref(), b"{}");
    }

    #[test]
    fn empty_body_has_no_content_type() {
        let s = to_string(Response::new(StatusCode::NoContent).into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::Ok).keep_alive(false);
        assert!(!r.is_keep_alive());
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn clones_are_identical() {
        let r = Response::new(StatusCode::BadGateway).body("upstream down");
        let copy = r.clone();
        assert_eq!(r, copy);
        assert_eq!(copy.status(), StatusCode::BadGateway);
    }
}
