use std::net::SocketAddr;

use routeway::app::App;
use routeway::config::ServerConfig;
use routeway::http::HttpResponse;
use routeway::middleware::LoggerMiddleware;
use routeway::router::RouteDecl;
use routeway::security::SecurityHeadersMiddleware;
use routeway::server::Server;
use routeway::view::{View, handler_fn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn routes() -> Vec<RouteDecl> {
    let greet = View::new().get(handler_fn(|ctx, out| {
        Box::pin(async move {
            let name = ctx.param("name").unwrap_or("stranger").to_owned();
            HttpResponse::with_body(format!("hello {name}")).finalize(out).await;
            Ok(())
        })
    }));
    let stream = View::new().get(handler_fn(|_ctx, out| {
        Box::pin(async move {
            HttpResponse::streaming(&b"streamed body"[..]).finalize(out).await;
            Ok(())
        })
    }));
    let escape = View::new().get(handler_fn(|ctx, out| {
        Box::pin(async move {
            HttpResponse::redirect(ctx, "https://evil.example/y").finalize(out).await;
            Ok(())
        })
    }));

    vec![
        RouteDecl::new("/greet/:name?").view(greet),
        RouteDecl::new("/stream").view(stream),
        RouteDecl::new("/escape").view(escape),
        RouteDecl::new("/old").redirect("/greet/again"),
    ]
}

async fn start(config: ServerConfig) -> SocketAddr {
    init_tracing();
    let mut app = App::new(config);
    app.use_middleware(LoggerMiddleware)
        .use_middleware(SecurityHeadersMiddleware::new())
        .routes(routes())
        .unwrap();
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(app));
    addr
}

/// Sends `raw` and reads until the server closes the connection.
async fn exchange(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn serves_a_routed_request() {
    let addr = start(ServerConfig::default()).await;
    let wire = exchange(
        addr,
        "GET /greet/ada HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(wire.contains("X-Frame-Options: SAMEORIGIN\r\n"));
    assert!(wire.contains("Content-Type: text/html;charset=UTF-8\r\n"));
    assert!(wire.ends_with("\r\n\r\nhello ada"));
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests() {
    let addr = start(ServerConfig::default()).await;
    let wire = exchange(
        addr,
        "GET /greet/one HTTP/1.1\r\nHost: a\r\n\r\nGET /greet HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(wire.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(wire.contains("Connection: keep-alive\r\n"));
    assert!(wire.contains("hello one"));
    assert!(wire.ends_with("hello stranger"));
}

#[tokio::test]
async fn unknown_paths_are_404() {
    let addr = start(ServerConfig::default()).await;
    let wire = exchange(addr, "GET /nope HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(wire.ends_with("can not find page /nope"));
}

#[tokio::test]
async fn streams_chunked_bodies() {
    let addr = start(ServerConfig::default()).await;
    let wire = exchange(addr, "GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(wire.contains("Transfer-Encoding: chunked\r\n"));
    assert!(wire.contains("streamed body"));
    assert!(wire.ends_with("0\r\n\r\n"));
}

#[tokio::test]
async fn redirects_stay_on_origin() {
    let addr = start(ServerConfig::default()).await;

    let wire = exchange(
        addr,
        "GET /old HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(wire.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(wire.contains("Location: http://example.test/greet/again\r\n"));

    let wire = exchange(
        addr,
        "GET /escape HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(wire.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(!wire.contains("Location:"));
}

#[tokio::test]
async fn rejects_oversized_and_malformed_requests() {
    let addr = start(ServerConfig {
        max_request_size: 256,
        ..ServerConfig::default()
    })
    .await;

    let wire = exchange(addr, "POST /greet HTTP/1.1\r\nContent-Length: 4096\r\n\r\n").await;
    assert!(wire.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    assert!(wire.contains("Connection: close\r\n"));

    let wire = exchange(addr, "\x01 garbage\r\n\r\n").await;
    assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}
