//! One request, end to end: pipeline, then route table, then cleanup.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::context::Context;
use crate::http::{HttpResponse, ResponseWriter};
use crate::middleware::{Middleware, MiddlewareHandler, OriginUrlMiddleware, Pipeline};
use crate::router::{RouteDecl, RouteError, RouteTable};
use crate::security::{MemorySessionStore, SessionConfig, SessionMiddleware, SessionStore};

/// Owns everything needed to answer a request.
///
/// Build it up front, then hand it to [`Server::run`](crate::server::Server::run);
/// it is read-only once serving starts.
///
/// # Examples
///
/// ```
/// use routeway::app::App;
/// use routeway::config::ServerConfig;
/// use routeway::middleware::LoggerMiddleware;
/// use routeway::router::RouteDecl;
/// use routeway::view::{View, handler_fn};
///
/// let hello = View::new().get(handler_fn(|_ctx, out| {
///     Box::pin(async move {
///         routeway::http::HttpResponse::with_body("hello").finalize(out).await;
///         Ok(())
///     })
/// }));
///
/// let mut app = App::new(ServerConfig::default());
/// app.use_middleware(LoggerMiddleware)
///     .routes([RouteDecl::new("/").view(hello)])
///     .unwrap();
/// assert_eq!(app.pipeline().names(), vec!["origin-url", "logger"]);
/// ```
pub struct App {
    config: ServerConfig,
    pipeline: Pipeline,
    routes: Option<RouteTable>,
}

impl App {
    /// Creates an app with the origin URL interceptor already installed.
    pub fn new(config: ServerConfig) -> Self {
        let mut origin = OriginUrlMiddleware::new();
        if let Some(header) = &config.secure_proxy_header {
            origin = origin.trust_proxy_header(header.clone());
        }
        let mut pipeline = Pipeline::new();
        pipeline.push(origin);
        Self {
            config,
            pipeline,
            routes: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn route_table(&self) -> Option<&RouteTable> {
        self.routes.as_ref()
    }

    pub fn use_middleware<M>(&mut self, middleware: M) -> &mut Self
    where
        M: Middleware + 'static,
    {
        self.pipeline.push(middleware);
        self
    }

    pub fn use_handler(&mut self, name: impl Into<String>, handler: MiddlewareHandler) -> &mut Self {
        self.pipeline.push_handler(name, handler);
        self
    }

    /// Installs the session accessor pair backed by `store`.
    pub fn use_sessions(&mut self, store: Arc<dyn SessionStore>) -> &mut Self {
        self.pipeline.push(SessionMiddleware::new(store));
        self
    }

    /// Installs an in-memory session store and returns it.
    ///
    /// The cookie keeps `Secure` only when a TLS-terminating proxy is
    /// configured through [`ServerConfig::secure_proxy_header`].
    pub fn use_memory_sessions(&mut self, config: SessionConfig) -> Arc<MemorySessionStore> {
        let tls = self.config.secure_proxy_header.is_some();
        let store = Arc::new(MemorySessionStore::over_transport(config, tls));
        self.use_sessions(store.clone());
        store
    }

    /// Builds the route table under the configured base and mode, replacing
    /// any previous one.
    pub fn routes(&mut self, routes: impl IntoIterator<Item = RouteDecl>) -> Result<&mut Self, RouteError> {
        self.routes = Some(RouteTable::build(self.config.route_table(), routes)?);
        Ok(self)
    }

    /// Runs the pipeline and the route table for one request.
    ///
    /// Never leaves `out` unfinished: a halted pipeline becomes a `500` with
    /// `Connection: close`, and a handler that forgot to respond gets a `500`.
    pub async fn handle(&self, ctx: &mut Context, out: &mut ResponseWriter) {
        out.set_flush_interval(self.config.header_flush_interval());

        if let Err(e) = self.pipeline.run(ctx, out).await {
            error!(error = %e, "pipeline failed");
            out.set_keep_alive(false);
            if !out.headers_sent() {
                HttpResponse::server_error(e.to_string()).finalize(out).await;
            }
            self.complete(out).await;
            return;
        }

        match &self.routes {
            Some(table) => {
                if let Err(e) = table.handle(ctx, out).await {
                    match e {
                        RouteError::NotFound { .. } | RouteError::OutsideBase { .. } => {
                            debug!(error = %e, "request not routed")
                        }
                        e => warn!(error = %e, "request failed"),
                    }
                }
            }
            None => {
                let e = RouteError::NotFound {
                    path: ctx.request().path().to_owned(),
                };
                HttpResponse::not_found(e.to_string()).finalize(out).await;
            }
        }
        self.complete(out).await;
    }

    async fn complete(&self, out: &mut ResponseWriter) {
        if out.is_finished() {
            return;
        }
        if !out.headers_sent() {
            warn!("handler returned without responding");
            HttpResponse::server_error("no response was produced")
                .finalize(out)
                .await;
        }
        if let Err(e) = out.end().await {
            warn!(error = %e, "failed to complete response");
            out.abort();
        }
    }
}
