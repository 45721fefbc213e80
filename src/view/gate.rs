//! Composable handler wrappers.
//!
//! A [`Gate`] turns one [`Handler`] into another with the same contract,
//! adding a precondition in front of it. Gates compose in an explicit order
//! through [`Gated`]: the first gate declared runs first.
//!
//! [`file_response`] is the odd one out: it adapts a handler that *produces a
//! file path* into a regular handler serving that file.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::{Handler, HandlerError, handler_fn};
use crate::context::Context;
use crate::http::HttpResponse;
use crate::http::stream::FileOptions;

/// A reusable wrapper around a handler.
pub trait Gate: Send + Sync {
    fn wrap(&self, inner: Handler) -> Handler;
}

/// Lets a request through only when it carries an active session.
///
/// Otherwise the client is redirected to the configured login path, or gets
/// a `401` when none is configured, and the handler reports
/// `"login required"`.
#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    redirect: Option<String>,
}

impl AuthGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirects anonymous clients to `path` instead of answering `401`.
    #[must_use]
    pub fn redirect_to(mut self, path: impl Into<String>) -> Self {
        self.redirect = Some(path.into());
        self
    }
}

impl Gate for AuthGate {
    fn wrap(&self, inner: Handler) -> Handler {
        let redirect = self.redirect.clone();
        handler_fn(move |ctx, out| {
            let inner = Arc::clone(&inner);
            let redirect = redirect.clone();
            Box::pin(async move {
                let active = ctx
                    .session()
                    .is_some_and(|s| !s.is_null() && s != serde_json::Value::Bool(false));
                if active {
                    return inner(ctx, out).await;
                }
                debug!(path = %ctx.request().path(), "anonymous request stopped at auth gate");
                let mut res = match &redirect {
                    Some(to) => HttpResponse::redirect(ctx, to),
                    None => HttpResponse::unauthorized("request unauthorized"),
                };
                res.finalize(out).await;
                Err(HandlerError::new("login required"))
            })
        })
    }
}

/// Lets a request through only when `check` approves it; otherwise `403`.
#[derive(Clone)]
pub struct PermissionGate {
    check: Arc<dyn Fn(&Context) -> bool + Send + Sync>,
}

impl PermissionGate {
    pub fn new(check: impl Fn(&Context) -> bool + Send + Sync + 'static) -> Self {
        Self {
            check: Arc::new(check),
        }
    }
}

impl Gate for PermissionGate {
    fn wrap(&self, inner: Handler) -> Handler {
        let check = Arc::clone(&self.check);
        handler_fn(move |ctx, out| {
            let inner = Arc::clone(&inner);
            let check = Arc::clone(&check);
            Box::pin(async move {
                if check(&*ctx) {
                    return inner(ctx, out).await;
                }
                HttpResponse::forbidden("permission denied")
                    .finalize(out)
                    .await;
                Err(HandlerError::new("permission denied"))
            })
        })
    }
}

/// Ordered gate composition around a base handler.
///
/// # Examples
///
/// ```rust
/// use routeway::http::HttpResponse;
/// use routeway::view::{AuthGate, Gated, PermissionGate, handler_fn};
///
/// let handler = Gated::new(handler_fn(|_ctx, out| {
///     Box::pin(async move {
///         HttpResponse::with_body("secret").finalize(out).await;
///         Ok(())
///     })
/// }))
/// .gate(AuthGate::new().redirect_to("/login"))
/// .gate(PermissionGate::new(|ctx| ctx.request().query_param("admin").is_some()))
/// .build();
/// ```
pub struct Gated {
    handler: Handler,
    gates: Vec<Box<dyn Gate>>,
}

impl Gated {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            gates: Vec::new(),
        }
    }

    /// Adds a gate inside the ones already declared.
    #[must_use]
    pub fn gate(mut self, gate: impl Gate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    /// Wraps the handler so that the first declared gate is outermost.
    pub fn build(self) -> Handler {
        self.gates
            .iter()
            .rev()
            .fold(self.handler, |inner, gate| gate.wrap(inner))
    }
}

/// A handler producing the path of the file to serve.
pub type FileHandler = Arc<
    dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<PathBuf, HandlerError>>
        + Send
        + Sync
        + 'static,
>;

/// Wraps a closure into a [`FileHandler`].
pub fn file_handler_fn<F>(f: F) -> FileHandler
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<PathBuf, HandlerError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Serves the file whose path `producer` yields, read whole into memory.
///
/// When the producer fails, the client gets a `500` carrying its message and
/// the error is passed on. Missing files answer `404`.
pub fn file_response(options: FileOptions, producer: FileHandler) -> Handler {
    handler_fn(move |ctx, out| {
        let producer = Arc::clone(&producer);
        let options = options.clone();
        Box::pin(async move {
            match producer(ctx).await {
                Ok(path) => {
                    HttpResponse::sync_file(path, options).finalize(out).await;
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "file handler failed");
                    HttpResponse::server_error(e.message()).finalize(out).await;
                    Err(e)
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::{Request, ResponseWriter, StatusCode};
    use crate::http::writer::testing::{capture, collect};
    use crate::security::{MemorySessionStore, SessionStore};

    fn context(raw: &str) -> Context {
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        let mut ctx = Context::new(request);
        ctx.set_original_url(format!("http://localhost{}", ctx.request().target()));
        ctx
    }

    fn ok() -> Handler {
        handler_fn(|_ctx, out| {
            Box::pin(async move {
                HttpResponse::with_body("inner").finalize(out).await;
                Ok(())
            })
        })
    }

    struct Trace {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Gate for Trace {
        fn wrap(&self, inner: Handler) -> Handler {
            let label = self.label;
            let log = Arc::clone(&self.log);
            handler_fn(move |ctx, out| {
                let inner = Arc::clone(&inner);
                log.lock().unwrap().push(label);
                Box::pin(async move { inner(ctx, out).await })
            })
        }
    }

    #[tokio::test]
    async fn auth_gate_without_session_is_401() {
        let handler = AuthGate::new().wrap(ok());
        let mut ctx = context("GET /private HTTP/1.1\r\n\r\n");
        let (mut out, client) = capture();
        let err = handler(&mut ctx, &mut out).await.unwrap_err();
        assert_eq!(err.message(), "login required");
        assert_eq!(out.status(), StatusCode::Unauthorized);
        assert!(collect(out, client).await.ends_with("request unauthorized"));
    }

    #[tokio::test]
    async fn auth_gate_redirects_when_configured() {
        let handler = AuthGate::new().redirect_to("/login").wrap(ok());
        let mut ctx = context("GET /private HTTP/1.1\r\n\r\n");
        let (mut out, _client) = capture();
        assert!(handler(&mut ctx, &mut out).await.is_err());
        assert_eq!(out.status(), StatusCode::Found);
        assert_eq!(out.header("location"), Some("http://localhost/login"));
    }

    #[tokio::test]
    async fn auth_gate_passes_active_session() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::default());
        let mut scratch = ResponseWriter::new(tokio::io::sink());
        let token = store.set_session(
            serde_json::json!({"user": 1}),
            &Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap().0,
            &mut scratch,
        );

        let mut ctx = context(&format!(
            "GET /private HTTP/1.1\r\nCookie: SessionId={token}\r\n\r\n"
        ));
        ctx.attach_sessions(store);
        let (mut out, client) = capture();
        AuthGate::new().wrap(ok())(&mut ctx, &mut out).await.unwrap();
        assert!(collect(out, client).await.ends_with("inner"));
    }

    #[tokio::test]
    async fn permission_gate_denies_with_403() {
        let handler = PermissionGate::new(|ctx| ctx.request().query_param("admin").as_deref() == Some("1"))
            .wrap(ok());

        let mut ctx = context("GET /x?admin=0 HTTP/1.1\r\n\r\n");
        let (mut out, _client) = capture();
        let err = handler(&mut ctx, &mut out).await.unwrap_err();
        assert_eq!(err.message(), "permission denied");
        assert_eq!(out.status(), StatusCode::Forbidden);

        let mut ctx = context("GET /x?admin=1 HTTP/1.1\r\n\r\n");
        let (mut out, _client) = capture();
        handler(&mut ctx, &mut out).await.unwrap();
        assert_eq!(out.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn gates_run_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Gated::new(ok())
            .gate(Trace { label: "outer", log: Arc::clone(&log) })
            .gate(Trace { label: "inner", log: Arc::clone(&log) })
            .build();
        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        let (mut out, _client) = capture();
        handler(&mut ctx, &mut out).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn auth_runs_before_permission() {
        let checked = Arc::new(Mutex::new(false));
        let seen = Arc::clone(&checked);
        let handler = Gated::new(ok())
            .gate(AuthGate::new())
            .gate(PermissionGate::new(move |_| {
                *seen.lock().unwrap() = true;
                true
            }))
            .build();
        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        let (mut out, _client) = capture();
        assert!(handler(&mut ctx, &mut out).await.is_err());
        assert!(!*checked.lock().unwrap());
        assert_eq!(out.status(), StatusCode::Unauthorized);
    }

    #[tokio::test]
    async fn file_response_serves_produced_path() {
        let dir = std::env::temp_dir().join(format!("routeway-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hello.txt");
        std::fs::write(&path, "hi there").unwrap();

        let produced = path.clone();
        let handler = file_response(
            FileOptions::new().attachment(true),
            file_handler_fn(move |_ctx| {
                let produced = produced.clone();
                Box::pin(async move { Ok(produced) })
            }),
        );
        let mut ctx = context("GET /download HTTP/1.1\r\n\r\n");
        let (mut out, client) = capture();
        handler(&mut ctx, &mut out).await.unwrap();
        assert_eq!(out.header("content-disposition"), Some("attachment"));
        assert!(collect(out, client).await.ends_with("hi there"));
    }

    #[tokio::test]
    async fn file_response_failure_is_500() {
        let handler = file_response(
            FileOptions::new(),
            file_handler_fn(|_ctx| Box::pin(async move { Err(HandlerError::new("no such report")) })),
        );
        let mut ctx = context("GET /download HTTP/1.1\r\n\r\n");
        let (mut out, client) = capture();
        let err = handler(&mut ctx, &mut out).await.unwrap_err();
        assert_eq!(err.message(), "no such report");
        assert_eq!(out.status(), StatusCode::InternalServerError);
        assert!(collect(out, client).await.ends_with("no such report"));
    }
}
