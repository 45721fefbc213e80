//! # routeway
//!
//! Route tables, middleware pipelines, view dispatch and response lifecycles
//! for async HTTP/1.1 servers.
//!
//! A request flows through three stages:
//!
//! 1. the [`middleware::Pipeline`], interceptors run one after another;
//! 2. the [`router::RouteTable`], which maps the path to a record;
//! 3. the record's [`view::View`], which picks a handler by method.
//!
//! Handlers answer through an [`http::HttpResponse`], finalized exactly once
//! onto the connection's [`http::ResponseWriter`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use routeway::app::App;
//! use routeway::config::ServerConfig;
//! use routeway::http::HttpResponse;
//! use routeway::router::RouteDecl;
//! use routeway::server::Server;
//! use routeway::view::{View, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hello = View::new().get(handler_fn(|ctx, out| {
//!         Box::pin(async move {
//!             let name = ctx.param("name").unwrap_or("world").to_owned();
//!             HttpResponse::with_body(format!("Hello, {name}!")).finalize(out).await;
//!             Ok(())
//!         })
//!     }));
//!
//!     let mut app = App::new(ServerConfig::default());
//!     app.routes([RouteDecl::new("/hello/:name?").view(hello)])?;
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(app).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;
pub mod view;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::App;
pub use config::{Mode, ServerConfig};
pub use context::Context;
pub use http::{Headers, HttpResponse, Method, Request, ResponseWriter, StatusCode};
pub use router::{RouteDecl, RouteTable};
pub use server::{Server, ServerError};
pub use view::{Handler, HandlerError, View, handler_fn};
