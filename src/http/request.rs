//! Parsed HTTP/1.1 requests.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use super::encoding::{self, Encoding};
use super::{Headers, Method, StatusCode};

/// Errors that make a request malformed.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("header {0:?} is not valid UTF-8")]
    InvalidHeaderValue(String),

    #[error("invalid Content-Length header {0:?}")]
    InvalidContentLength(String),

    #[error("request carries both Content-Length and Transfer-Encoding")]
    ConflictingFraming,

    #[error("unsupported transfer coding {0:?}")]
    UnsupportedTransferEncoding(String),

    #[error("malformed chunk: {0}")]
    InvalidChunk(&'static str),
}

impl RequestError {
    /// The status code the server answers this error with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TooLarge { .. } => StatusCode::PayloadTooLarge,
            Self::UnsupportedTransferEncoding(_) => StatusCode::NotImplemented,
            _ => StatusCode::BadRequest,
        }
    }
}

/// Decoded query-string pairs.
///
/// Behaves as an unordered multimap: duplicate keys are all kept, and callers
/// must not rely on iteration order.
///
/// # Examples
///
/// ```
/// use keel::http::QueryParams;
///
/// let q = QueryParams::parse("tag=a&tag=b&name=J%C3%BCrgen+M");
/// let mut tags: Vec<_> = q.get_all("tag").collect();
/// tags.sort();
/// assert_eq!(tags, vec!["a", "b"]);
/// assert_eq!(q.get("name"), Some("Jürgen M"));
/// assert_eq!(q.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parses an `application/x-www-form-urlencoded` string, percent-decoding
    /// names and values and treating `+` as a space.
    pub fn parse(query: &str) -> Self {
        let pairs = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { pairs }
    }

    /// Returns one value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `key`.
    pub fn get_all<'a, 'k>(
        &'a self,
        key: &'k str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'k> {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Re-serializes the pairs as a query string.
    pub fn to_query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish()
    }
}

/// A fully received HTTP/1.1 request.
///
/// Produced by [`RequestParser`](super::RequestParser) once the head and the
/// whole body have arrived.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    params: QueryParams,
    body: Bytes,
    remote: Option<SocketAddr>,
}

impl Request {
    /// Builds a request head from the pieces `httparse` produced.
    pub(crate) fn from_head(
        method: Option<&str>,
        target: Option<&str>,
        version: Option<u8>,
        fields: &[httparse::Header<'_>],
    ) -> Result<Self, RequestError> {
        let method: Method = match method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
        {
            Ok(m) => m,
            Err(never) => match never {},
        };

        let target = target.ok_or(RequestError::MissingField { field: "path" })?;
        let version = version.ok_or(RequestError::MissingField { field: "version" })?;

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };

        let mut headers = Headers::with_capacity(fields.len());
        for field in fields {
            let value = std::str::from_utf8(field.value)
                .map_err(|_| RequestError::InvalidHeaderValue(field.name.to_owned()))?;
            headers.add_received(field.name, value.trim());
        }

        let params = query.as_deref().map(QueryParams::parse).unwrap_or_default();

        Ok(Self {
            method,
            path,
            version,
            headers,
            query,
            params,
            body: Bytes::new(),
            remote: None,
        })
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub(crate) fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = Some(remote);
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the decoded query parameters.
    pub fn query(&self) -> &QueryParams {
        &self.params
    }

    /// Returns a parsed query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Address of the client that sent this request.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            false
        } else if self.headers.has_token("connection", "keep-alive") {
            true
        } else {
            self.version == 1
        }
    }

    /// Returns `true` if the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.version == 1
            && self
                .headers
                .get("expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    /// Returns `true` if the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .list("transfer-encoding")
            .last()
            .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
    }

    /// The client's `Accept-Encoding` preferences, highest weight first.
    pub fn accept_encodings(&self) -> Vec<(Encoding, f32)> {
        encoding::parse_accept_encoding(self.headers.list("accept-encoding"))
    }

    /// The supported encoding the server prefers among those the client
    /// accepts; [`Encoding::Identity`] when nothing matches.
    pub fn best_accept_encoding(&self) -> Encoding {
        encoding::negotiate(&self.accept_encodings())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &[u8]) -> Request {
        let mut fields = [httparse::EMPTY_HEADER; 16];
        let mut req = httparse::Request::new(&mut fields);
        assert!(req.parse(raw).unwrap().is_complete());
        Request::from_head(req.method, req.path, req.version, req.headers).unwrap()
    }

    #[test]
    fn parse_simple_get() {
        let req = head(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert!(req.body().is_empty());
    }

    #[test]
    fn parse_query_string() {
        let req = head(b"GET /search?q=rust&page=2&q=tokio HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust&page=2&q=tokio"));
        assert_eq!(req.query_param("page"), Some("2"));
        let mut all: Vec<_> = req.query().get_all("q").collect();
        all.sort();
        assert_eq!(all, vec!["rust", "tokio"]);
    }

    #[test]
    fn looked_up_values_outlive_the_key() {
        let req = head(b"GET /?page=2&tag=a&tag=b HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n");
        let (page, tags, encodings) = {
            let page_key = String::from("page");
            let tag_key = String::from("tag");
            let header = String::from("accept-encoding");
            (
                req.query_param(&page_key),
                req.query().get_all(&tag_key).collect::<Vec<_>>(),
                req.headers().list(&header).collect::<Vec<_>>(),
            )
        };
        assert_eq!(page, Some("2"));
        assert_eq!(tags.len(), 2);
        assert_eq!(encodings, vec!["gzip"]);
    }

    #[test]
    fn query_round_trip_keeps_every_pair() {
        let q = QueryParams::parse("a=1&a=2&b=x%20y");
        let again = QueryParams::parse(&q.to_query_string());
        assert_eq!(again.len(), 3);
        assert_eq!(again.get("b"), Some("x y"));
    }

    #[test]
    fn keep_alive_rules() {
        assert!(head(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").is_keep_alive());
        assert!(!head(b"GET / HTTP/1.0\r\n\r\n").is_keep_alive());
        assert!(head(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").is_keep_alive());
        assert!(!head(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").is_keep_alive());
    }

    #[test]
    fn framing_headers() {
        let req = head(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(req.content_length(), Some(5));
        assert!(!req.is_chunked());

        let req = head(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert!(req.is_chunked());
    }

    #[test]
    fn non_utf8_header_value_is_rejected() {
        let mut fields = [httparse::EMPTY_HEADER; 4];
        let mut req = httparse::Request::new(&mut fields);
        let raw = b"GET / HTTP/1.1\r\nX-Name: caf\xe9\r\n\r\n";
        assert!(req.parse(raw).unwrap().is_complete());
        let err = Request::from_head(req.method, req.path, req.version, req.headers).unwrap_err();
        assert!(matches!(err, RequestError::InvalidHeaderValue(name) if name == "X-Name"));
    }

    #[test]
    fn expect_continue() {
        let req = head(b"PUT / HTTP/1.1\r\nExpect: 100-continue\r\n\r\n");
        assert!(req.expects_continue());
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            RequestError::TooLarge { max_bytes: 1 }.status(),
            StatusCode::PayloadTooLarge
        );
        assert_eq!(RequestError::ConflictingFraming.status(), StatusCode::BadRequest);
    }
}
