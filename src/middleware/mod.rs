//! Middleware pipeline: an ordered list of request interceptors run before
//! routing.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by interceptors.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable interceptor function.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`Pipeline`]: the ordered, append-only list.
//!
//! Interceptors run strictly one after another in registration order. The
//! first one to return `Err` halts the chain; nothing after it runs.
//!
//! ## Built-ins
//!
//! - [`LoggerMiddleware`]: logs each request as it enters the pipeline.
//! - [`OriginUrlMiddleware`]: resolves the absolute URL the client asked for.
//! - [`JsonBodyMiddleware`]: parses `application/json` bodies into [`JsonBody`].

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::http::{HttpResponse, ResponseWriter};
use crate::view::{Handler, HandlerError, handler_fn};

/// A type-erased, reference-counted interceptor function.
///
/// Same shape as a view [`Handler`]: `Ok(())` lets the chain continue.
///
/// ```rust
/// use routeway::middleware::MiddlewareHandler;
/// use routeway::view::handler_fn;
///
/// let stamp: MiddlewareHandler = handler_fn(|_ctx, out| {
///     Box::pin(async move {
///         out.set_header("X-Served-By", "routeway");
///         Ok(())
///     })
/// });
/// ```
pub type MiddlewareHandler = Handler;

/// Why the pipeline stopped.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("middleware {name} failed: {source}")]
    Interceptor {
        name: String,
        #[source]
        source: HandlerError,
    },
}

/// The core trait for interceptors.
///
/// # Contract
///
/// - Implementations must be `Send + Sync`: the pipeline is shared by every
///   connection task.
/// - An implementation that fails after writing a response should finalize
///   that response before returning `Err`.
pub trait Middleware: Send + Sync {
    /// Name used in logs and in [`MiddlewareError`].
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        out: &'a mut ResponseWriter,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// ```rust
/// use std::sync::Arc;
/// use routeway::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    handler_fn(move |ctx, out| {
        let middleware = Arc::clone(&middleware);
        Box::pin(async move { middleware.handle(ctx, out).await })
    })
}

/// Ordered, append-only interceptor list.
///
/// # Examples
///
/// ```rust
/// use routeway::middleware::{LoggerMiddleware, OriginUrlMiddleware, Pipeline};
///
/// let mut pipeline = Pipeline::new();
/// pipeline.push(OriginUrlMiddleware::new()).push(LoggerMiddleware);
/// assert_eq!(pipeline.names(), vec!["origin-url", "logger"]);
/// ```
#[derive(Clone, Default)]
pub struct Pipeline {
    layers: Vec<(String, MiddlewareHandler)>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a [`Middleware`].
    pub fn push<M>(&mut self, middleware: M) -> &mut Self
    where
        M: Middleware + 'static,
    {
        let name = middleware.name().to_owned();
        self.push_handler(name, from_middleware(Arc::new(middleware)))
    }

    /// Appends a bare handler under `name`.
    pub fn push_handler(&mut self, name: impl Into<String>, handler: MiddlewareHandler) -> &mut Self {
        self.layers.push((name.into(), handler));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Runs every interceptor in order, stopping at the first failure.
    pub async fn run(&self, ctx: &mut Context, out: &mut ResponseWriter) -> Result<(), MiddlewareError> {
        for (name, handler) in &self.layers {
            if let Err(source) = handler(ctx, out).await {
                warn!(middleware = %name, error = %source, "pipeline halted");
                return Err(MiddlewareError::Interceptor {
                    name: name.clone(),
                    source,
                });
            }
        }
        Ok(())
    }
}

/// Logs each request's method and path as it enters the pipeline.
///
/// The matching completion line (status and duration) is emitted by the
/// server once the response has gone out.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn name(&self) -> &str {
        "logger"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        _out: &'a mut ResponseWriter,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let request = ctx.request();
            info!("--> {} {}", request.method(), request.target());
            Ok(())
        })
    }
}

/// Resolves `scheme://host/path?query` into [`Context::original_url`].
///
/// The scheme is `https` only when a trusted proxy header is configured and
/// the request carries it with the value `https`.
#[derive(Debug, Clone, Default)]
pub struct OriginUrlMiddleware {
    secure_proxy_header: Option<String>,
}

impl OriginUrlMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trusts `header` (e.g. `X-Forwarded-Proto`) to tell whether the client
    /// connected over TLS. Only set this behind a proxy that overwrites it.
    #[must_use]
    pub fn trust_proxy_header(mut self, header: impl Into<String>) -> Self {
        self.secure_proxy_header = Some(header.into());
        self
    }

    fn resolve(&self, ctx: &Context) -> String {
        let request = ctx.request();
        let secure = self
            .secure_proxy_header
            .as_deref()
            .and_then(|h| request.headers().get(h))
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("https"));
        let scheme = if secure { "https" } else { "http" };
        let host = request.host().unwrap_or("localhost");
        format!("{scheme}://{host}{}", request.target())
    }
}

impl Middleware for OriginUrlMiddleware {
    fn name(&self) -> &str {
        "origin-url"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        _out: &'a mut ResponseWriter,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let url = self.resolve(ctx);
            debug!(url = %url, "original url resolved");
            ctx.set_original_url(url);
            Ok(())
        })
    }
}

/// Parsed JSON request body, stored in the context extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonBody(pub Value);

/// Parses `application/json` bodies into a [`JsonBody`] extension.
///
/// A malformed body is answered with `400` and halts the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBodyMiddleware;

impl Middleware for JsonBodyMiddleware {
    fn name(&self) -> &str {
        "json-body"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        out: &'a mut ResponseWriter,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let is_json = ctx
                .request()
                .headers()
                .get("content-type")
                .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/json"));
            if !is_json || ctx.request().body().is_empty() {
                return Ok(());
            }
            match ctx.json::<Value>() {
                Ok(value) => {
                    ctx.extensions_mut().insert(JsonBody(value));
                    Ok(())
                }
                Err(e) => {
                    HttpResponse::bad_request(format!("malformed JSON body: {e}"))
                        .finalize(out)
                        .await;
                    Err(HandlerError::with_source("malformed JSON body", e))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::{Request, StatusCode};

    fn context(raw: &str) -> Context {
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(request)
    }

    fn recorder(log: &Arc<Mutex<Vec<u8>>>, id: u8, fail: bool) -> MiddlewareHandler {
        let log = Arc::clone(log);
        handler_fn(move |_ctx, _out| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                tokio::task::yield_now().await;
                log.lock().unwrap().push(id);
                if fail {
                    Err(HandlerError::new(format!("interceptor {id} refused")))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        for id in 1..=3 {
            pipeline.push_handler(format!("m{id}"), recorder(&log, id, false));
        }
        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        let mut out = ResponseWriter::new(tokio::io::sink());
        pipeline.run(&mut ctx, &mut out).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn error_in_second_stops_third() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .push_handler("first", recorder(&log, 1, false))
            .push_handler("second", recorder(&log, 2, true))
            .push_handler("third", recorder(&log, 3, false));

        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        let mut out = ResponseWriter::new(tokio::io::sink());
        let MiddlewareError::Interceptor { name, source } =
            pipeline.run(&mut ctx, &mut out).await.unwrap_err();
        assert_eq!(name, "second");
        assert_eq!(source.message(), "interceptor 2 refused");
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn origin_url_from_host() {
        let mut ctx = context("GET /a/b?x=1 HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        let mut out = ResponseWriter::new(tokio::io::sink());
        OriginUrlMiddleware::new().handle(&mut ctx, &mut out).await.unwrap();
        assert_eq!(ctx.original_url(), Some("http://example.com:8080/a/b?x=1"));
    }

    #[tokio::test]
    async fn origin_url_trusts_only_configured_header() {
        let raw = "GET / HTTP/1.1\r\nHost: a.example\r\nX-Forwarded-Proto: https\r\n\r\n";
        let mut out = ResponseWriter::new(tokio::io::sink());

        let mut ctx = context(raw);
        OriginUrlMiddleware::new().handle(&mut ctx, &mut out).await.unwrap();
        assert_eq!(ctx.original_url(), Some("http://a.example/"));

        let mut ctx = context(raw);
        OriginUrlMiddleware::new()
            .trust_proxy_header("X-Forwarded-Proto")
            .handle(&mut ctx, &mut out)
            .await
            .unwrap();
        assert_eq!(ctx.original_url(), Some("https://a.example/"));
    }

    #[tokio::test]
    async fn json_body_is_parsed() {
        let mut ctx = context(
            "POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"n\": [1]}\n",
        );
        let mut out = ResponseWriter::new(tokio::io::sink());
        JsonBodyMiddleware.handle(&mut ctx, &mut out).await.unwrap();
        assert_eq!(
            ctx.extensions().get::<JsonBody>(),
            Some(&JsonBody(serde_json::json!({"n": [1]})))
        );
    }

    #[tokio::test]
    async fn malformed_json_halts_with_400() {
        let mut pipeline = Pipeline::new();
        let reached = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reached);
        pipeline.push(JsonBodyMiddleware).push_handler(
            "after",
            handler_fn(move |_ctx, _out| {
                *flag.lock().unwrap() = true;
                Box::pin(async move { Ok(()) })
            }),
        );

        let mut ctx = context(
            "POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\n{oops",
        );
        let mut out = ResponseWriter::new(tokio::io::sink());
        assert!(pipeline.run(&mut ctx, &mut out).await.is_err());
        assert!(!*reached.lock().unwrap());
        assert_eq!(out.status(), StatusCode::BadRequest);
        assert!(out.is_finished());
    }

    #[tokio::test]
    async fn non_json_bodies_are_ignored() {
        let mut ctx = context("POST / HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\n{oops");
        let mut out = ResponseWriter::new(tokio::io::sink());
        JsonBodyMiddleware.handle(&mut ctx, &mut out).await.unwrap();
        assert!(ctx.extensions().get::<JsonBody>().is_none());
    }
}
