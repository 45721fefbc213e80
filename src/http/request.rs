//! Inbound request parsing on top of [`httparse`].

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Header slots used by [`Request::parse`].
pub const DEFAULT_MAX_HEADERS: usize = 64;

/// Why a buffer could not be turned into a [`Request`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("more than {limit} header lines")]
    TooManyHeaders { limit: usize },
}

/// One parsed HTTP/1.x request, body included.
///
/// The body holds at most `Content-Length` bytes of what followed the head;
/// without that header it holds everything that followed.
///
/// # Examples
///
/// ```
/// use routeway::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\nCookie: a=1; SessionId=xyz\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.target(), "/hello?name=world");
/// assert_eq!(request.query_param("name").as_deref(), Some("world"));
/// assert_eq!(request.cookie("SessionId").as_deref(), Some("xyz"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Parses `buf` with room for [`DEFAULT_MAX_HEADERS`] header lines.
    ///
    /// Returns the request and the offset where its body starts in `buf`.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        Self::parse_limited(buf, DEFAULT_MAX_HEADERS)
    }

    /// Parses `buf`, refusing requests with more than `max_headers` header lines.
    ///
    /// # Errors
    ///
    /// [`RequestError::Incomplete`] while the head has not fully arrived;
    /// the other variants when it never will parse.
    pub fn parse_limited(buf: &[u8], max_headers: usize) -> Result<(Self, usize), RequestError> {
        let mut slots = vec![httparse::EMPTY_HEADER; max_headers];
        let mut head = httparse::Request::new(&mut slots);

        let body_offset = match head.parse(buf) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => return Err(RequestError::Incomplete),
            Err(httparse::Error::TooManyHeaders) => {
                return Err(RequestError::TooManyHeaders { limit: max_headers });
            }
            Err(e) => return Err(RequestError::Parse(e)),
        };

        let method = match head.method {
            Some(m) => match m.parse::<Method>() {
                Ok(method) => method,
                Err(never) => match never {},
            },
            None => return Err(RequestError::MissingField { field: "method" }),
        };
        let target = head.path.ok_or(RequestError::MissingField { field: "path" })?;
        let version = head.version.ok_or(RequestError::MissingField { field: "version" })?;

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };

        let mut headers = Headers::with_capacity(head.headers.len());
        for header in head.headers.iter() {
            // Non-UTF-8 values are dropped.
            if let Ok(value) = std::str::from_utf8(header.value) {
                headers.append(header.name, value);
            }
        }

        let rest = &buf[body_offset..];
        let len = declared_length(&headers).map_or(rest.len(), |n| n.min(rest.len()));

        let request = Self {
            method,
            path,
            query,
            version,
            headers,
            body: Bytes::copy_from_slice(&rest[..len]),
        };
        Ok((request, body_offset))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path without the query string, still percent-encoded.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path plus `?query`, as the client sent it.
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// First value of query parameter `key`, form-decoded.
    pub fn query_param(&self, key: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    /// Value of cookie `name` from the `Cookie` header(s), percent-decoded.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all("cookie")
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| {
                let v = v.trim_matches('"');
                urlencoding::decode(v).map_or_else(|_| v.to_owned(), |d| d.into_owned())
            })
    }

    /// HTTP/1.1 stays open unless told `Connection: close`; HTTP/1.0 closes
    /// unless told `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.trim().eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        declared_length(&self.headers)
    }
}

fn declared_length(headers: &Headers) -> Option<usize> {
    headers.get("content-length")?.trim().parse().ok()
}
