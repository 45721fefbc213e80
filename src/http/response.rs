//! Response lifecycle shared by every response variant.
//!
//! An [`HttpResponse`] accumulates headers, cookies, a status and a body,
//! then [`finalize`](HttpResponse::finalize)s exactly once onto a
//! [`ResponseWriter`]. Variants differ only in their body:
//!
//! | Constructor                          | Body                         |
//! |--------------------------------------|------------------------------|
//! | [`HttpResponse::new`], error helpers | buffered bytes               |
//! | [`HttpResponse::streaming`]          | piped from an async reader   |
//! | [`HttpResponse::stream_file`]        | file opened as a stream      |
//! | [`HttpResponse::sync_file`]          | file read fully into memory  |
//!
//! A variant that cannot produce its planned output (missing file, missing
//! stream, unsafe redirect) records a delegated *actual* response, and
//! finalization hands over to it entirely.

use std::future::Future;
use std::pin::Pin;

use bytes::BytesMut;
use serde::Serialize;
use tracing::warn;
use url::Url;

use super::cookie::{self, Cookie, CookieError, CookieOptions, SameSiteSetting};
use super::stream::{FileBody, StreamBody};
use super::{Headers, ResponseWriter, StatusCode};
use crate::context::Context;

/// Content type applied at finalization when none was set.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html;charset=UTF-8";

pub(crate) enum Body {
    Buffered(BufferedBody),
    Stream(StreamBody),
    File(FileBody),
}

pub(crate) struct BufferedBody {
    content: BytesMut,
    writable: bool,
}

impl BufferedBody {
    fn new(content: &[u8]) -> Self {
        Self {
            content: BytesMut::from(content),
            writable: true,
        }
    }
}

/// A per-request response object with a one-way transition to *closed*.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use routeway::http::{HttpResponse, ResponseWriter, StatusCode};
/// use routeway::http::cookie::CookieOptions;
///
/// let mut out = ResponseWriter::new(tokio::io::sink());
/// let mut res = HttpResponse::with_body("<h1>hi</h1>");
/// res.set_header("X-Frame-Options", "DENY");
/// res.set_cookie("theme", "dark", CookieOptions::new().same_site(true)).unwrap();
/// res.finalize(&mut out).await;
///
/// assert!(res.is_closed());
/// assert_eq!(out.status(), StatusCode::Ok);
/// assert_eq!(out.header("content-type"), Some("text/html;charset=UTF-8"));
/// assert_eq!(out.header("content-length"), Some("11"));
/// # }
/// ```
pub struct HttpResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: Headers,
    cookies: Vec<Cookie>,
    pub(crate) closed: bool,
    pub(crate) actual: Option<Box<HttpResponse>>,
    pub(crate) body: Body,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponse {
    /// An empty buffered `200 OK` response.
    pub fn new() -> Self {
        Self::with_body("")
    }

    /// A buffered `200 OK` response holding `content`.
    pub fn with_body(content: impl AsRef<[u8]>) -> Self {
        Self::from_body(Body::Buffered(BufferedBody::new(content.as_ref())))
    }

    pub(crate) fn from_body(body: Body) -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Headers::new(),
            cookies: Vec::new(),
            closed: false,
            actual: None,
            body,
        }
    }

    fn error(status: StatusCode, message: impl AsRef<str>) -> Self {
        let mut res = Self::with_body(message.as_ref());
        res.status = status;
        res
    }

    /// `400 Bad Request` with `message` as the body.
    pub fn bad_request(message: impl AsRef<str>) -> Self {
        Self::error(StatusCode::BadRequest, message)
    }

    /// `401 Unauthorized` with `message` as the body.
    pub fn unauthorized(message: impl AsRef<str>) -> Self {
        Self::error(StatusCode::Unauthorized, message)
    }

    /// `403 Forbidden` with `message` as the body.
    pub fn forbidden(message: impl AsRef<str>) -> Self {
        Self::error(StatusCode::Forbidden, message)
    }

    /// `404 Not Found` with `message` as the body.
    pub fn not_found(message: impl AsRef<str>) -> Self {
        Self::error(StatusCode::NotFound, message)
    }

    /// `410 Gone` with `message` as the body.
    pub fn gone(message: impl AsRef<str>) -> Self {
        Self::error(StatusCode::Gone, message)
    }

    /// `500 Internal Server Error` with `message` as the body.
    pub fn server_error(message: impl AsRef<str>) -> Self {
        Self::error(StatusCode::InternalServerError, message)
    }

    /// `501 Not Implemented` with `message` as the body.
    pub fn not_implemented(message: impl AsRef<str>) -> Self {
        Self::error(StatusCode::NotImplemented, message)
    }

    /// `405 Method Not Allowed`, listing `permitted` in the `Allow` header.
    pub fn not_allowed<S: AsRef<str>>(permitted: &[S]) -> Self {
        let mut res = Self::error(StatusCode::MethodNotAllowed, "");
        for method in permitted {
            res.headers.append("Allow", method.as_ref());
        }
        res
    }

    /// A buffered response carrying `data` as JSON.
    ///
    /// # Errors
    ///
    /// Propagates the serializer's error when `data` cannot be encoded.
    pub fn json<T: Serialize + ?Sized>(data: &T) -> Result<Self, serde_json::Error> {
        let mut res = Self::with_body(serde_json::to_vec(data)?);
        res.headers.set("Content-Type", "application/json");
        Ok(res)
    }

    /// `302 Found` to `to`, resolved against the request's original URL.
    ///
    /// The redirect is only honored when the target keeps the scheme and host
    /// of the original URL; otherwise finalization produces a `500`.
    pub fn redirect(ctx: &Context, to: &str) -> Self {
        Self::redirect_from(ctx.original_url(), to, StatusCode::Found)
    }

    /// `301 Moved Permanently`, with the same safety rules as [`redirect`](Self::redirect).
    pub fn permanent_redirect(ctx: &Context, to: &str) -> Self {
        Self::redirect_from(ctx.original_url(), to, StatusCode::MovedPermanently)
    }

    /// Redirect resolved against an explicit originating URL.
    pub fn redirect_from(original: Option<&str>, to: &str, status: StatusCode) -> Self {
        let mut res = Self::new();
        res.status = status;

        let Some(original) = original else {
            res.actual = Some(Box::new(Self::server_error(format!(
                "cannot redirect to {to} without an originating URL"
            ))));
            return res;
        };

        let target = Url::parse(original).and_then(|current| {
            let next = current.join(to)?;
            Ok((current, next))
        });
        match target {
            Ok((current, next))
                if next.scheme() == current.scheme()
                    && next.host_str() == current.host_str()
                    && next.port_or_known_default() == current.port_or_known_default() =>
            {
                res.headers.set("Location", next.as_str());
            }
            _ => {
                res.actual = Some(Box::new(Self::server_error(format!(
                    "Unsafe redirect from {original} to {to}"
                ))));
            }
        }
        res
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        if self.guard_closed("status") {
            self.status = status;
        }
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The substituted response, if this one gave up on its planned output.
    pub fn actual(&self) -> Option<&HttpResponse> {
        self.actual.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Adds a value to `name`, turning it into a multi-value header if it
    /// already holds one.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if self.guard_closed("header") {
            self.headers.append(name, value);
        }
        self
    }

    /// Replaces every value of `name`.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if self.guard_closed("header") {
            self.headers.set(name, value);
        }
        self
    }

    /// Removes one value of `name`, or the whole header when `value` is `None`.
    pub fn delete_header(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        if self.guard_closed("header") {
            match value {
                Some(value) => {
                    self.headers.remove_value(name, value);
                }
                None => {
                    self.headers.remove(name);
                }
            }
        }
        self
    }

    /// Staged cookies, one per name.
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Stages a cookie; a later cookie with the same key replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`CookieError`] when `sameSite` or `expires` do not validate.
    pub fn set_cookie(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        options: CookieOptions,
    ) -> Result<&mut Self, CookieError> {
        let cookie = Cookie::resolve(key, value, options)?;
        if self.guard_closed("cookie") {
            match self.cookies.iter_mut().find(|c| c.name == cookie.name) {
                Some(existing) => *existing = cookie,
                None => self.cookies.push(cookie),
            }
        }
        Ok(self)
    }

    /// Stages an immediately expired cookie for `key`.
    ///
    /// The cookie is marked `Secure` when the key carries a `__Secure`/`__Host`
    /// prefix or when the same-site policy is anything but `none`.
    ///
    /// # Errors
    ///
    /// Returns [`CookieError::InvalidSameSite`] for an unknown policy name.
    pub fn delete_cookie(
        &mut self,
        key: &str,
        path: Option<&str>,
        domain: Option<&str>,
        same_site: Option<SameSiteSetting>,
    ) -> Result<&mut Self, CookieError> {
        let secure = cookie::has_security_prefix(key)
            || same_site.as_ref().is_some_and(SameSiteSetting::is_restrictive);
        let mut options = CookieOptions::new()
            .max_age(0)
            .expires(std::time::SystemTime::UNIX_EPOCH)
            .path(path.unwrap_or("/"))
            .secure(secure);
        options.domain = domain.map(str::to_owned);
        options.same_site = same_site;
        self.set_cookie(key, "", options)
    }

    /// Appends to a buffered body. Warns and does nothing once closed, when
    /// the body is not writable, or for non-buffered variants.
    pub fn write(&mut self, content: impl AsRef<[u8]>) -> &mut Self {
        if self.closed {
            warn!("current connection has been closed, write ignored");
            return self;
        }
        match &mut self.body {
            Body::Buffered(buffered) if buffered.writable => {
                buffered.content.extend_from_slice(content.as_ref());
            }
            _ => warn!("current response is not writeable, write ignored"),
        }
        self
    }

    pub fn set_writable(&mut self, writable: bool) -> &mut Self {
        if let Body::Buffered(buffered) = &mut self.body {
            buffered.writable = writable;
        }
        self
    }

    /// The buffered payload as text (empty for non-buffered variants).
    pub fn read(&self) -> String {
        match &self.body {
            Body::Buffered(buffered) => String::from_utf8_lossy(&buffered.content).into_owned(),
            _ => String::new(),
        }
    }

    /// Sends this response on `out`. Only the first call has any effect;
    /// later calls log a warning.
    pub async fn finalize(&mut self, out: &mut ResponseWriter) {
        if self.closed {
            warn!(status = %self.status, "response already finalized, no more editable");
            return;
        }
        if self.finalize_actual(out).await {
            return;
        }
        if matches!(self.body, Body::Stream(_)) {
            self.finalize_stream(out).await;
        } else if matches!(self.body, Body::File(_)) {
            self.finalize_file(out).await;
        } else {
            self.finalize_buffered(out).await;
        }
    }

    /// Finalizes the delegated response, if any. Returns whether it did.
    pub(crate) fn finalize_actual<'a>(
        &'a mut self,
        out: &'a mut ResponseWriter,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self.actual.as_mut() {
                Some(actual) => {
                    actual.finalize(out).await;
                    self.closed = true;
                    true
                }
                None => false,
            }
        })
    }

    /// Copies headers, cookies and status onto `out` and closes this response.
    pub(crate) fn commit(&mut self, out: &mut ResponseWriter) {
        if !self.headers.contains("content-type") {
            self.headers.set("Content-Type", DEFAULT_CONTENT_TYPE);
        }
        for name in self.headers.names() {
            if let Some(value) = self.headers.joined(name) {
                out.set_header(name, value);
            }
        }
        for cookie in &self.cookies {
            out.append_header("Set-Cookie", cookie.serialize());
        }
        out.set_status(self.status);
        self.closed = true;
    }

    async fn finalize_buffered(&mut self, out: &mut ResponseWriter) {
        self.commit(out);
        let content = match &mut self.body {
            Body::Buffered(buffered) => buffered.content.clone().freeze(),
            _ => return,
        };
        out.remove_header("Transfer-Encoding");
        out.set_header("Content-Length", content.len().to_string());
        let sent = match out.write(&content).await {
            Ok(()) => out.end().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(error = %e, "failed to write buffered response");
            out.abort();
        }
    }

    // Returns `true` when mutation is still allowed.
    fn guard_closed(&self, what: &str) -> bool {
        if self.closed {
            warn!(what, "response already finalized, mutation ignored");
        }
        !self.closed
    }
}

/// Builds the error response matching `status`, carrying `message`.
///
/// Codes without a dedicated variant fall back to a `500`.
pub fn create_error(status: StatusCode, message: impl AsRef<str>) -> HttpResponse {
    match status {
        StatusCode::BadRequest => HttpResponse::bad_request(message),
        StatusCode::Unauthorized => HttpResponse::unauthorized(message),
        StatusCode::Forbidden => HttpResponse::forbidden(message),
        StatusCode::NotFound => HttpResponse::not_found(message),
        StatusCode::Gone => HttpResponse::gone(message),
        StatusCode::NotImplemented => HttpResponse::not_implemented(message),
        _ => HttpResponse::server_error(message),
    }
}
