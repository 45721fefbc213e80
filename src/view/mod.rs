//! Per-method view dispatch.
//!
//! A [`View`] maps lower-cased HTTP method names to [`Handler`]s. Handlers
//! receive the request [`Context`] and the connection [`ResponseWriter`] and
//! report back through their returned `Result`: `Ok(())` when the exchange is
//! done, `Err` when something went wrong. A handler that fails is expected to
//! have finalized a response before returning the error.
//!
//! Cross-cutting preconditions are layered on with [`gate`]s.

pub mod gate;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{error, warn};

use crate::context::Context;
use crate::http::cookie::CookieError;
use crate::http::{HttpResponse, ResponseWriter};

pub use gate::{AuthGate, FileHandler, Gate, Gated, PermissionGate, file_handler_fn, file_response};

/// Type-erased async request handler.
///
/// The returned future borrows the context and writer for the duration of
/// the call. Build one from a closure with [`handler_fn`].
pub type Handler = Arc<
    dyn for<'a> Fn(&'a mut Context, &'a mut ResponseWriter) -> BoxFuture<'a, Result<(), HandlerError>>
        + Send
        + Sync
        + 'static,
>;

/// Wraps a closure into a [`Handler`].
///
/// # Examples
///
/// ```rust
/// use routeway::http::HttpResponse;
/// use routeway::view::{View, handler_fn};
///
/// let hello = handler_fn(|_ctx, out| {
///     Box::pin(async move {
///         HttpResponse::with_body("hello").finalize(out).await;
///         Ok(())
///     })
/// });
/// let view = View::new().get(hello);
/// assert_eq!(view.permitted(), vec!["GET"]);
/// ```
pub fn handler_fn<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Context, &'a mut ResponseWriter) -> BoxFuture<'a, Result<(), HandlerError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Failure a handler, gate or interceptor reports to its caller.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::with_source(e.to_string(), e)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_source(e.to_string(), e)
    }
}

impl From<CookieError> for HandlerError {
    fn from(e: CookieError) -> Self {
        Self::with_source(e.to_string(), e)
    }
}

/// Why [`View::dispatch`] did not complete normally.
///
/// By the time one of these is returned, a response describing the failure
/// has already been sent (or the connection marked for closing).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("method {method} not allowed, expected one of {permitted:?}")]
    MethodNotAllowed {
        method: String,
        permitted: Vec<String>,
    },

    #[error("method {method} is declared but not implemented")]
    Unimplemented { method: String },

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Method table for one route.
///
/// Registering a method again replaces its handler.
#[derive(Clone, Default)]
pub struct View {
    methods: HashMap<String, Option<Handler>>,
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` (case-insensitive).
    #[must_use]
    pub fn on(mut self, method: impl AsRef<str>, handler: Handler) -> Self {
        self.set(method, Some(handler));
        self
    }

    /// Declares `method` without a handler; requests to it answer `500`.
    #[must_use]
    pub fn declare(mut self, method: impl AsRef<str>) -> Self {
        self.set(method, None);
        self
    }

    #[must_use]
    pub fn get(self, handler: Handler) -> Self {
        self.on("get", handler)
    }

    #[must_use]
    pub fn post(self, handler: Handler) -> Self {
        self.on("post", handler)
    }

    #[must_use]
    pub fn put(self, handler: Handler) -> Self {
        self.on("put", handler)
    }

    #[must_use]
    pub fn patch(self, handler: Handler) -> Self {
        self.on("patch", handler)
    }

    #[must_use]
    pub fn delete(self, handler: Handler) -> Self {
        self.on("delete", handler)
    }

    pub fn set(&mut self, method: impl AsRef<str>, handler: Option<Handler>) {
        self.methods
            .insert(method.as_ref().to_ascii_lowercase(), handler);
    }

    pub fn allows(&self, method: &str) -> bool {
        self.methods.contains_key(&method.to_ascii_lowercase())
    }

    /// Registered methods, upper-cased and sorted.
    pub fn permitted(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .methods
            .keys()
            .map(|m| m.to_ascii_uppercase())
            .collect();
        methods.sort();
        methods
    }

    /// Runs the handler registered for the request's method.
    ///
    /// - unknown method: `405` with an `Allow` header, [`DispatchError::MethodNotAllowed`]
    /// - declared without a handler: `500`, [`DispatchError::Unimplemented`]
    /// - handler panics: `500` carrying the panic message, [`DispatchError::Panicked`]
    /// - handler returns `Err`: passed through as [`DispatchError::Handler`]
    pub async fn dispatch(
        &self,
        ctx: &mut Context,
        out: &mut ResponseWriter,
    ) -> Result<(), DispatchError> {
        let method = ctx.request().method().view_key();
        let handler = match self.methods.get(&method) {
            Some(Some(handler)) => Arc::clone(handler),
            Some(None) => {
                warn!(method = %method, path = %ctx.request().path(), "handler not implemented");
                HttpResponse::server_error(format!(
                    "method {} is not implemented",
                    method.to_ascii_uppercase()
                ))
                .finalize(out)
                .await;
                return Err(DispatchError::Unimplemented { method });
            }
            None => {
                let permitted = self.permitted();
                warn!(method = %method, path = %ctx.request().path(), "method not allowed");
                HttpResponse::not_allowed(&permitted).finalize(out).await;
                return Err(DispatchError::MethodNotAllowed { method, permitted });
            }
        };

        let outcome = AssertUnwindSafe(async { handler(ctx, out).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(result) => result.map_err(DispatchError::from),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(method = %method, error = %message, "handler panicked");
                if out.headers_sent() {
                    out.abort();
                } else {
                    HttpResponse::server_error(&message).finalize(out).await;
                }
                Err(DispatchError::Panicked(message))
            }
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("methods", &self.permitted())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}
