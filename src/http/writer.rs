//! Outbound side of one HTTP/1.1 exchange.
//!
//! A [`ResponseWriter`] stages a status line and headers, writes them lazily
//! the first time body bytes (or an explicit flush) go out, and frames the body
//! with chunked encoding when `Transfer-Encoding: chunked` was staged.
//! Interceptors may stage headers here before any
//! [`HttpResponse`](super::HttpResponse) exists; a response lifecycle merges
//! its own headers on top when it finalizes.

use std::io;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{Headers, StatusCode};

/// Boxed transport the writer owns for the duration of one exchange.
pub type Transport = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection-level response sink.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// use routeway::http::{ResponseWriter, StatusCode};
///
/// let mut out = ResponseWriter::new(tokio::io::sink());
/// out.set_status(StatusCode::Ok);
/// out.set_header("Content-Length", "2");
/// out.write(b"ok").await?;
/// out.end().await?;
/// assert!(out.headers_sent());
/// assert!(out.is_finished());
/// # Ok(())
/// # }
/// ```
pub struct ResponseWriter {
    io: Transport,
    status: StatusCode,
    headers: Headers,
    keep_alive: bool,
    head_sent: bool,
    chunked: bool,
    finished: bool,
    body_bytes: usize,
    flush_interval: Option<Duration>,
}

impl ResponseWriter {
    /// Wraps a transport. The writer starts at `200 OK` with keep-alive on.
    pub fn new(io: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::from_boxed(Box::new(io))
    }

    /// Wraps an already boxed transport without boxing it again.
    pub fn from_boxed(io: Transport) -> Self {
        Self {
            io,
            status: StatusCode::Ok,
            headers: Headers::new(),
            keep_alive: true,
            head_sent: false,
            chunked: false,
            finished: false,
            body_bytes: 0,
            flush_interval: None,
        }
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is sent.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Whether the connection may carry another request once this one ends.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Header flush period streaming responses use unless they set their own.
    pub fn set_flush_interval(&mut self, interval: Duration) {
        self.flush_interval = Some(interval);
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.head_sent {
            debug!(status = %status, "status ignored, head already sent");
            return;
        }
        self.status = status;
    }

    /// Staged headers (or, once the head is out, the headers that were sent).
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if !self.head_sent {
            self.headers.set(name, value);
        }
    }

    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if !self.head_sent {
            self.headers.append(name, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        if !self.head_sent {
            self.headers.remove(name);
        }
    }

    pub fn headers_sent(&self) -> bool {
        self.head_sent
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of body bytes written so far (excluding chunk framing).
    pub fn body_len(&self) -> usize {
        self.body_bytes
    }

    /// Writes the head if it has not gone out yet, then flushes the transport.
    pub async fn flush_headers(&mut self) -> io::Result<()> {
        if !self.head_sent {
            self.send_head(false).await?;
        }
        self.io.flush().await
    }

    /// Writes a slice of the body, sending the head first if needed.
    ///
    /// # Errors
    ///
    /// Fails if the exchange already ended or the transport rejects the write.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::other("response already ended"));
        }
        if !self.head_sent {
            self.send_head(false).await?;
        }
        if data.is_empty() {
            return Ok(());
        }
        if self.chunked {
            let mut frame = BytesMut::with_capacity(data.len() + 16);
            frame.put(format!("{:x}\r\n", data.len()).as_bytes());
            frame.put(data);
            frame.put(&b"\r\n"[..]);
            self.io.write_all(&frame).await?;
        } else {
            self.io.write_all(data).await?;
        }
        self.body_bytes += data.len();
        Ok(())
    }

    /// Completes the exchange. Calling it again is a no-op.
    pub async fn end(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.head_sent {
            self.send_head(true).await?;
        }
        if self.chunked {
            self.io.write_all(b"0\r\n\r\n").await?;
        }
        self.io.flush().await?;
        self.finished = true;
        Ok(())
    }

    /// Gives up on the exchange without completing the body framing.
    ///
    /// The connection is marked for closing so the peer observes a truncated
    /// response instead of waiting for more bytes.
    pub fn abort(&mut self) {
        self.finished = true;
        self.keep_alive = false;
    }

    /// Returns the transport so the connection can serve its next request.
    pub fn into_inner(self) -> Transport {
        self.io
    }

    async fn send_head(&mut self, finishing: bool) -> io::Result<()> {
        let head = self.head_bytes(finishing);
        self.head_sent = true;
        self.io.write_all(&head).await
    }

    // Decides body framing and serializes the status line plus headers.
    fn head_bytes(&mut self, finishing: bool) -> BytesMut {
        self.chunked = self
            .headers
            .get("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

        if !self.chunked && !self.headers.contains("content-length") {
            if finishing {
                self.headers.set("Content-Length", "0");
            } else {
                // Body delimited by connection close.
                self.keep_alive = false;
            }
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64);
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{capture, collect};
    use super::*;

    #[tokio::test]
    async fn empty_end_sends_zero_length() {
        let (mut out, client) = capture();
        out.set_status(StatusCode::NoContent);
        out.end().await.unwrap();
        let wire = collect(out, client).await;
        assert!(wire.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(wire.contains("Content-Length: 0\r\n"));
        assert!(wire.contains("Connection: keep-alive\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn fixed_length_body() {
        let (mut out, client) = capture();
        out.set_header("Content-Length", "5");
        out.write(b"hello").await.unwrap();
        out.end().await.unwrap();
        assert_eq!(out.body_len(), 5);
        let wire = collect(out, client).await;
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn chunked_body_is_framed() {
        let (mut out, client) = capture();
        out.set_header("Transfer-Encoding", "chunked");
        out.write(b"abc").await.unwrap();
        out.write(b"defghijklmnopqrs").await.unwrap();
        out.end().await.unwrap();
        let wire = collect(out, client).await;
        assert!(wire.ends_with("\r\n\r\n3\r\nabc\r\n10\r\ndefghijklmnopqrs\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn unframed_body_closes_connection() {
        let (mut out, client) = capture();
        out.write(b"raw").await.unwrap();
        out.end().await.unwrap();
        assert!(!out.is_keep_alive());
        let wire = collect(out, client).await;
        assert!(wire.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn end_is_idempotent_and_write_after_end_fails() {
        let (mut out, client) = capture();
        out.end().await.unwrap();
        out.end().await.unwrap();
        assert!(out.write(b"late").await.is_err());
        let wire = collect(out, client).await;
        assert_eq!(wire.matches("HTTP/1.1").count(), 1);
    }

    #[tokio::test]
    async fn headers_are_frozen_once_sent() {
        let (mut out, client) = capture();
        out.set_header("X-Early", "1");
        out.flush_headers().await.unwrap();
        out.set_header("X-Late", "1");
        out.set_status(StatusCode::NotFound);
        assert_eq!(out.status(), StatusCode::Ok);
        out.end().await.unwrap();
        let wire = collect(out, client).await;
        assert!(wire.contains("X-Early: 1\r\n"));
        assert!(!wire.contains("X-Late"));
    }
}
