//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and runs each HTTP/1.1 request through an [`App`].
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::context::Context;
use crate::http::writer::Transport;
use crate::http::{
    HttpResponse, ResponseWriter, StatusCode,
    request::{Request, RequestError},
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The routeway HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use routeway::app::App;
/// use routeway::config::ServerConfig;
/// use routeway::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let app = App::new(ServerConfig::default());
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(app).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the listener fails, running every request
    /// through `app`. The app is shared read-only by all connection tasks.
    pub async fn run(self, app: App) -> Result<(), ServerError> {
        let app = Arc::new(app);
        info!(address = %self.local_addr, base = %app.config().base, "routeway listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let app = Arc::clone(&app);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, app).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Serves requests on one connection until the peer closes it, a response
/// asks for `Connection: close`, or the request is rejected outright.
async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, app: Arc<App>) -> std::io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let mut transport: Transport = Box::new(writer);
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let limits = Limits {
        request_size: app.config().max_request_size,
        headers: app.config().max_headers,
    };

    loop {
        let (request, consumed) = match read_request(&mut reader, &mut buf, limits).await? {
            Incoming::Request(request, consumed) => (request, consumed),
            Incoming::Closed => {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
            Incoming::TooLarge => {
                warn!(peer = %peer_addr, "request too large, sending 413");
                reject(transport, StatusCode::PayloadTooLarge, "request entity too large").await;
                break;
            }
            Incoming::Malformed(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                reject(transport, StatusCode::BadRequest, &format!("bad request: {e}")).await;
                break;
            }
        };
        let _ = buf.split_to(consumed);

        let started = Instant::now();
        let method = request.method().clone();
        let path = request.path().to_owned();
        let mut out = ResponseWriter::from_boxed(transport);
        out.set_keep_alive(request.is_keep_alive());
        let mut ctx = Context::new(request);

        app.handle(&mut ctx, &mut out).await;

        info!(
            peer = %peer_addr,
            "<-- {method} {path} {} {:?}",
            out.status().as_u16(),
            started.elapsed()
        );

        let keep_alive = out.is_keep_alive();
        transport = out.into_inner();
        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    request_size: usize,
    headers: usize,
}

enum Incoming {
    Request(Request, usize),
    Closed,
    TooLarge,
    Malformed(RequestError),
}

/// Reads until `buf` holds one complete request, head and body.
async fn read_request<R>(reader: &mut R, buf: &mut BytesMut, limits: Limits) -> std::io::Result<Incoming>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            match Request::parse_limited(&buf[..], limits.headers) {
                Ok((request, body_offset)) => {
                    let declared = request.content_length().unwrap_or(0);
                    let total = match body_offset.checked_add(declared) {
                        Some(total) if total <= limits.request_size => total,
                        _ => return Ok(Incoming::TooLarge),
                    };
                    if buf.len() >= total {
                        // Reparse so the body stops where this request does.
                        let (request, _) = match Request::parse_limited(&buf[..total], limits.headers) {
                            Ok(parsed) => parsed,
                            Err(e) => return Ok(Incoming::Malformed(e)),
                        };
                        return Ok(Incoming::Request(request, total));
                    }
                }
                Err(RequestError::Incomplete) => {}
                Err(e) => return Ok(Incoming::Malformed(e)),
            }
        }
        if buf.len() > limits.request_size {
            return Ok(Incoming::TooLarge);
        }
        if reader.read_buf(buf).await? == 0 {
            return Ok(Incoming::Closed);
        }
    }
}

async fn reject(transport: Transport, status: StatusCode, message: &str) {
    let mut out = ResponseWriter::from_boxed(transport);
    out.set_keep_alive(false);
    let mut res = HttpResponse::with_body(message);
    res.set_status(status);
    res.finalize(&mut out).await;
}
