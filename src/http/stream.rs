//! Streaming and file-backed response bodies.
//!
//! A streaming body pipes an async reader onto the connection with chunked
//! framing, flushing headers on a fixed interval while bytes are moving.
//! File bodies either stream the file the same way or read it whole into
//! memory at finalization time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, warn};

use super::ResponseWriter;
use super::response::{Body, HttpResponse};

/// Byte producer behind a streaming response.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Interval at which headers are flushed while a stream is in flight.
pub const HEADER_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 16 * 1024;

/// Progress of a streaming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Waiting,
    Processing,
    Ended,
    Errored,
}

pub(crate) struct StreamBody {
    source: Option<ByteSource>,
    state: TransferState,
    flush_interval: Option<Duration>,
}

impl StreamBody {
    fn new(source: Option<ByteSource>) -> Self {
        Self {
            source,
            state: TransferState::Waiting,
            flush_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileMode {
    Streamed,
    Buffered,
}

pub(crate) struct FileBody {
    path: PathBuf,
    exists: bool,
    options: FileOptions,
    mode: FileMode,
    stream: StreamBody,
}

/// How a file is presented to the client.
///
/// # Examples
///
/// ```
/// use routeway::http::stream::FileOptions;
///
/// let opts = FileOptions::new().attachment(true).filename("report.csv");
/// assert!(opts.as_attachment);
/// assert_eq!(opts.encoding, "UTF-8");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOptions {
    pub as_attachment: bool,
    /// Charset advertised for textual content types.
    pub encoding: String,
    /// Display name for `Content-Disposition`, also preferred for MIME lookup.
    pub filename: Option<String>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            as_attachment: false,
            encoding: "UTF-8".to_owned(),
            filename: None,
        }
    }
}

impl FileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn attachment(mut self, as_attachment: bool) -> Self {
        self.as_attachment = as_attachment;
        self
    }

    #[must_use]
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

impl HttpResponse {
    /// A chunked response piping `source` to the client.
    pub fn streaming(source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::stream_with(Some(Box::new(source)))
    }

    /// A streaming response whose source is attached later with
    /// [`set_stream_source`](Self::set_stream_source). Finalizing it without a
    /// source produces a `500`.
    pub fn empty_stream() -> Self {
        Self::stream_with(None)
    }

    fn stream_with(source: Option<ByteSource>) -> Self {
        let mut res = Self::from_body(Body::Stream(StreamBody::new(source)));
        res.headers.set("Content-Type", "application/octet-stream");
        res.headers.set("Transfer-Encoding", "chunked");
        res.headers.set("Accept-Ranges", "bytes");
        res
    }

    /// Serves the file at `path` as a chunked stream.
    ///
    /// Existence is checked now; a missing file turns into a `404` when the
    /// response is finalized.
    pub fn stream_file(path: impl Into<PathBuf>, options: FileOptions) -> Self {
        Self::file_with(path.into(), options, FileMode::Streamed)
    }

    /// Serves the file at `path` from memory with a `Content-Length`.
    pub fn sync_file(path: impl Into<PathBuf>, options: FileOptions) -> Self {
        let mut res = Self::file_with(path.into(), options, FileMode::Buffered);
        res.headers.remove_value("Transfer-Encoding", "chunked");
        res.headers.remove_value("Accept-Ranges", "bytes");
        res
    }

    fn file_with(path: PathBuf, options: FileOptions, mode: FileMode) -> Self {
        let mut res = Self::stream_with(None);
        res.headers.remove("Content-Type");
        res.body = Body::File(FileBody {
            exists: path.is_file(),
            path,
            options,
            mode,
            stream: StreamBody::new(None),
        });
        res
    }

    /// Attaches (or replaces) the byte source of a streaming response.
    pub fn set_stream_source(&mut self, source: impl AsyncRead + Send + Unpin + 'static) -> &mut Self {
        if self.closed {
            warn!("this connection has been closed, and no more editable");
            return self;
        }
        match &mut self.body {
            Body::Stream(stream) => {
                stream.source = Some(Box::new(source));
                stream.state = TransferState::Waiting;
            }
            _ => warn!("stream source ignored on a non-streaming response"),
        }
        self
    }

    /// Points a file response at another file, re-checking existence.
    pub fn set_file(&mut self, path: impl Into<PathBuf>, options: FileOptions) -> &mut Self {
        if self.closed {
            warn!("this connection has been closed, and no more editable");
            return self;
        }
        match &mut self.body {
            Body::File(file) => {
                let path = path.into();
                file.exists = path.is_file();
                file.path = path;
                file.options = options;
            }
            _ => warn!("file ignored on a non-file response"),
        }
        self
    }

    pub fn set_as_attachment(&mut self, as_attachment: bool) -> &mut Self {
        if let Body::File(file) = &mut self.body {
            file.options.as_attachment = as_attachment;
        }
        self
    }

    /// Overrides the header flush period for this response.
    ///
    /// Without an override the writer's configured period applies, falling
    /// back to [`HEADER_FLUSH_INTERVAL`].
    pub fn set_flush_interval(&mut self, interval: Duration) -> &mut Self {
        if let Some(stream) = self.stream_body_mut() {
            stream.flush_interval = Some(interval);
        }
        self
    }

    /// Transfer progress for streaming and file variants, `None` otherwise.
    pub fn transfer_state(&self) -> Option<TransferState> {
        match &self.body {
            Body::Stream(stream) => Some(stream.state),
            Body::File(file) => Some(file.stream.state),
            Body::Buffered(_) => None,
        }
    }

    fn stream_body_mut(&mut self) -> Option<&mut StreamBody> {
        match &mut self.body {
            Body::Stream(stream) => Some(stream),
            Body::File(file) => Some(&mut file.stream),
            Body::Buffered(_) => None,
        }
    }

    pub(crate) async fn finalize_stream(&mut self, out: &mut ResponseWriter) {
        let Some(stream) = self.stream_body_mut() else {
            return;
        };
        let period = stream
            .flush_interval
            .or(out.flush_interval())
            .unwrap_or(HEADER_FLUSH_INTERVAL);
        let Some(mut source) = stream.source.take() else {
            self.actual = Some(Box::new(HttpResponse::server_error("stream instance error")));
            self.finalize_actual(out).await;
            return;
        };
        stream.state = TransferState::Processing;

        self.commit(out);
        out.remove_header("Content-Length");
        let state = pipe(&mut source, out, period).await;
        if let Some(stream) = self.stream_body_mut() {
            stream.state = state;
        }
    }

    pub(crate) async fn finalize_file(&mut self, out: &mut ResponseWriter) {
        let Body::File(file) = &self.body else {
            return;
        };
        let path = file.path.clone();
        let exists = file.exists;
        let options = file.options.clone();
        let mode = file.mode;

        self.headers.remove("Content-Disposition");
        if !exists {
            self.actual = Some(Box::new(HttpResponse::not_found(format!(
                "cannot find file you are looking for in '{}'",
                path.display()
            ))));
            self.finalize_actual(out).await;
            return;
        }

        let disposition = if options.as_attachment {
            "attachment"
        } else {
            "inline"
        };
        let disposition = match &options.filename {
            Some(name) => format!("{disposition}; filename={}", quoted(name)),
            None => disposition.to_owned(),
        };
        self.headers.set("Content-Disposition", disposition);
        if !self.headers.contains("content-type") {
            let lookup = options
                .filename
                .as_deref()
                .map_or(path.as_path(), Path::new);
            self.headers
                .set("Content-Type", content_type_for(lookup, &options.encoding));
        }

        match mode {
            FileMode::Streamed => match tokio::fs::File::open(&path).await {
                Ok(file) => {
                    if let Some(stream) = self.stream_body_mut() {
                        stream.source = Some(Box::new(file));
                    }
                    self.finalize_stream(out).await;
                }
                Err(e) => self.substitute_read_failure(out, &path, e).await,
            },
            FileMode::Buffered => match tokio::fs::read(&path).await {
                Ok(content) => {
                    self.headers.set("Content-Length", content.len().to_string());
                    self.commit(out);
                    let sent = match out.write(&content).await {
                        Ok(()) => out.end().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!(path = %path.display(), error = %e, "failed to send file");
                        out.abort();
                    }
                }
                Err(e) => self.substitute_read_failure(out, &path, e).await,
            },
        }
    }

    async fn substitute_read_failure(
        &mut self,
        out: &mut ResponseWriter,
        path: &Path,
        e: std::io::Error,
    ) {
        error!(path = %path.display(), error = %e, "failed to read file");
        self.actual = Some(Box::new(HttpResponse::server_error(format!(
            "cannot read file '{}'",
            path.display()
        ))));
        self.finalize_actual(out).await;
    }
}

// Copies `source` to `out` until EOF or failure, flushing headers every
// `period` meanwhile. The interval is dropped with this frame.
async fn pipe(source: &mut ByteSource, out: &mut ResponseWriter, period: Duration) -> TransferState {
    if let Err(e) = out.flush_headers().await {
        warn!(error = %e, "client went away before the stream started");
        out.abort();
        return TransferState::Errored;
    }

    let mut ticker = interval_at(Instant::now() + period, period);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = source.read(&mut buf) => match read {
                Ok(0) => {
                    return match out.end().await {
                        Ok(()) => {
                            debug!(bytes = out.body_len(), "stream ended");
                            TransferState::Ended
                        }
                        Err(e) => {
                            error!(error = %e, "failed to terminate stream");
                            out.abort();
                            TransferState::Errored
                        }
                    };
                }
                Ok(n) => {
                    if let Err(e) = out.write(&buf[..n]).await {
                        error!(error = %e, "failed to forward stream chunk");
                        out.abort();
                        return TransferState::Errored;
                    }
                }
                Err(e) => {
                    error!(error = %e, "stream source failed");
                    out.abort();
                    return TransferState::Errored;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = out.flush_headers().await {
                    error!(error = %e, "failed to flush stream");
                    out.abort();
                    return TransferState::Errored;
                }
            }
        }
    }
}

// RFC 6266 quoted-string; control characters are dropped.
fn quoted(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars().filter(|c| !c.is_control()) {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// MIME type for `name`, with a charset for textual types; `text/plain` when unknown.
pub fn content_type_for(name: &Path, encoding: &str) -> String {
    match mime_guess::from_path(name).first() {
        Some(mime) => {
            let textual = mime.type_() == mime_guess::mime::TEXT
                || matches!(mime.subtype().as_str(), "json" | "javascript" | "xml");
            if textual {
                format!("{}; charset={}", mime.essence_str(), encoding.to_ascii_lowercase())
            } else {
                mime.essence_str().to_owned()
            }
        }
        None => "text/plain".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};

    use tokio::io::ReadBuf;

    use super::*;
    use crate::http::StatusCode;
    use crate::http::writer::testing::{capture, collect};

    fn temp_file(name: &str, content: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("routeway-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    struct FailingSource;

    impl AsyncRead for FailingSource {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "boom")))
        }
    }

    #[tokio::test]
    async fn streaming_pipes_source_chunked() {
        let (mut out, client) = capture();
        let mut res = HttpResponse::streaming(&b"streamed bytes"[..]);
        assert_eq!(res.transfer_state(), Some(TransferState::Waiting));
        res.finalize(&mut out).await;

        assert_eq!(res.transfer_state(), Some(TransferState::Ended));
        let wire = collect(out, client).await;
        assert!(wire.contains("Transfer-Encoding: chunked\r\n"));
        assert!(wire.contains("Accept-Ranges: bytes\r\n"));
        assert!(wire.contains("Content-Type: application/octet-stream\r\n"));
        assert!(wire.ends_with("e\r\nstreamed bytes\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn streaming_without_source_substitutes_500() {
        let (mut out, client) = capture();
        let mut res = HttpResponse::empty_stream();
        res.finalize(&mut out).await;
        assert!(res.is_closed());
        assert_eq!(out.status(), StatusCode::InternalServerError);
        let wire = collect(out, client).await;
        assert!(!wire.contains("chunked"));
        assert!(wire.ends_with("stream instance error"));
    }

    #[tokio::test]
    async fn slow_source_is_piped_while_flushing() {
        use tokio::io::AsyncWriteExt;

        let (mut feed, source) = tokio::io::duplex(64);
        let (mut out, client) = capture();
        out.set_flush_interval(Duration::from_millis(5));
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            feed.write_all(b"late").await.unwrap();
        });

        let mut res = HttpResponse::streaming(source);
        res.finalize(&mut out).await;
        producer.await.unwrap();

        assert_eq!(res.transfer_state(), Some(TransferState::Ended));
        assert!(collect(out, client).await.ends_with("4\r\nlate\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn late_source_is_used() {
        let (mut out, client) = capture();
        let mut res = HttpResponse::empty_stream();
        res.set_stream_source(&b"late"[..]);
        res.finalize(&mut out).await;
        assert_eq!(res.transfer_state(), Some(TransferState::Ended));
        assert!(collect(out, client).await.contains("4\r\nlate\r\n"));
    }

    #[tokio::test]
    async fn source_failure_marks_errored_and_closes() {
        let (mut out, _client) = capture();
        let mut res = HttpResponse::streaming(FailingSource);
        res.finalize(&mut out).await;
        assert_eq!(res.transfer_state(), Some(TransferState::Errored));
        assert!(out.is_finished());
        assert!(!out.is_keep_alive());
    }

    #[tokio::test]
    async fn client_disconnect_mid_stream_marks_errored() {
        use tokio::io::AsyncWriteExt;

        let (mut feed, source) = tokio::io::duplex(64);
        let (client, server) = tokio::io::duplex(1024);
        let mut out = ResponseWriter::new(server);
        out.set_flush_interval(Duration::from_millis(5));
        let producer = tokio::spawn(async move {
            feed.write_all(b"first").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(client);
            feed.write_all(b"second").await.unwrap();
            feed
        });

        let mut res = HttpResponse::streaming(source);
        res.finalize(&mut out).await;
        drop(producer.await.unwrap());

        assert_eq!(res.transfer_state(), Some(TransferState::Errored));
        assert!(out.is_finished());
        assert!(!out.is_keep_alive());
    }

    #[tokio::test]
    async fn filename_is_quoted() {
        let path = temp_file("plain.txt", b"x");
        let (mut out, _client) = capture();
        let opts = FileOptions::new().attachment(true).filename("we\"ird\\na\r\nme.txt");
        HttpResponse::sync_file(&path, opts).finalize(&mut out).await;
        assert_eq!(
            out.header("content-disposition"),
            Some("attachment; filename=\"we\\\"ird\\\\name.txt\"")
        );
    }

    #[tokio::test]
    async fn stream_file_sets_disposition_and_type() {
        let path = temp_file("notes.txt", b"line one\n");
        let (mut out, client) = capture();
        let mut res = HttpResponse::stream_file(&path, FileOptions::new());
        res.finalize(&mut out).await;

        assert_eq!(res.transfer_state(), Some(TransferState::Ended));
        let wire = collect(out, client).await;
        assert!(wire.contains("Content-Disposition: inline\r\n"));
        assert!(wire.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(wire.contains("9\r\nline one\n\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn sync_file_reads_whole_file() {
        let path = temp_file("data.bin", b"\x00\x01\x02");
        let (mut out, client) = capture();
        let opts = FileOptions::new().attachment(true).filename("report.json");
        let mut res = HttpResponse::sync_file(&path, opts);
        res.finalize(&mut out).await;

        assert!(out.is_finished());
        assert_eq!(out.header("content-length"), Some("3"));
        assert_eq!(
            out.header("content-disposition"),
            Some("attachment; filename=\"report.json\"")
        );
        assert_eq!(out.header("content-type"), Some("application/json; charset=utf-8"));
        assert!(out.header("transfer-encoding").is_none());
        assert!(out.header("accept-ranges").is_none());
        assert!(collect(out, client).await.ends_with("\r\n\r\n\x00\x01\x02"));
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let missing = std::env::temp_dir().join("routeway-definitely-missing.txt");
        for mut res in [
            HttpResponse::stream_file(&missing, FileOptions::new()),
            HttpResponse::sync_file(&missing, FileOptions::new()),
        ] {
            let (mut out, _client) = capture();
            res.finalize(&mut out).await;
            assert_eq!(out.status(), StatusCode::NotFound);
            assert_eq!(res.actual().map(HttpResponse::status), Some(StatusCode::NotFound));
            assert!(out.header("content-disposition").is_none());
        }
    }

    #[tokio::test]
    async fn set_file_rechecks_existence() {
        let path = temp_file("late.html", b"<p>");
        let mut res = HttpResponse::sync_file("/definitely/not/here", FileOptions::new());
        res.set_file(&path, FileOptions::new());
        let (mut out, _client) = capture();
        res.finalize(&mut out).await;
        assert_eq!(out.status(), StatusCode::Ok);
        assert_eq!(out.header("content-type"), Some("text/html; charset=utf-8"));
    }

    #[test]
    fn content_type_lookup() {
        assert_eq!(content_type_for(Path::new("a.png"), "UTF-8"), "image/png");
        assert_eq!(content_type_for(Path::new("a.css"), "latin1"), "text/css; charset=latin1");
        assert_eq!(content_type_for(Path::new("noext"), "UTF-8"), "text/plain");
    }
}
