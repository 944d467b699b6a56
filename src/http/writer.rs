//! Answering a request: one-shot responses and chunked streams.
//!
//! A [`ResponseWriter`] is handed to the handler together with the
//! [`Request`]. It may be moved to another thread and used later; nothing is
//! written on the handler's stack. Every send returns a [`Promise`] that
//! resolves with the number of bytes written once the transport has flushed
//! them to the socket, or rejects if the connection goes away first.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use super::encoding::{self, Compressor, Encoding};
use super::response::write_head;
use super::{Headers, Request, Response, StatusCode};
use crate::peer::{DisconnectReason, FileBody, FrameEnd, Peer, PeerEvent, SendError};
use crate::promise::{Promise, Rejection};

/// Buffered stream bytes that trigger an automatic flush.
pub const DEFAULT_STREAM_THRESHOLD: usize = 8 * 1024;

/// Errors reported through response promises and stream writes.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("a response was already sent for this request")]
    AlreadySent,

    #[error("response body of {size} bytes exceeds the limit of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("the response stream has already ended")]
    StreamEnded,

    #[error("compression failed: {0}")]
    Compression(#[from] io::Error),

    #[error("cannot serve file: {0}")]
    File(#[source] io::Error),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Where an exchange is between dispatch and its last byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Pending = 0,
    Streaming = 1,
    Sent = 2,
}

/// Response state shared by the writer and the connection task, so that
/// exactly one response is started per request.
#[derive(Debug)]
pub(crate) struct Exchange {
    phase: AtomicU8,
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Pending as u8),
        }
    }

    /// Moves out of `Pending`. Only the first claimant succeeds.
    pub fn claim(&self, next: Phase) -> bool {
        self.phase
            .compare_exchange(
                Phase::Pending as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            0 => Phase::Pending,
            1 => Phase::Streaming,
            _ => Phase::Sent,
        }
    }
}

#[derive(Debug, Default)]
struct ReportInner {
    status: Mutex<Option<StatusCode>>,
    bytes: AtomicUsize,
}

/// What was sent for a request: the status and the number of bytes handed to
/// the transport. Clones observe the same report.
#[derive(Debug, Clone, Default)]
pub struct ResponseReport {
    inner: Arc<ReportInner>,
}

impl ResponseReport {
    pub fn status(&self) -> Option<StatusCode> {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bytes_written(&self) -> usize {
        self.inner.bytes.load(Ordering::Acquire)
    }

    fn set_status(&self, status: StatusCode) {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    fn add_bytes(&self, n: usize) {
        self.inner.bytes.fetch_add(n, Ordering::AcqRel);
    }
}

/// The handle a handler answers a request through.
///
/// Dropping a writer that never sent anything answers
/// `500 Internal Server Error`.
pub struct ResponseWriter {
    peer: Arc<Peer>,
    exchange: Arc<Exchange>,
    headers: Headers,
    accepted: Vec<(Encoding, f32)>,
    compression: Encoding,
    level: Option<i32>,
    keep_alive: bool,
    head_only: bool,
    max_response_size: usize,
    report: ResponseReport,
}

impl ResponseWriter {
    pub(crate) fn new(
        peer: Arc<Peer>,
        exchange: Arc<Exchange>,
        request: &Request,
        max_response_size: usize,
    ) -> Self {
        Self {
            peer,
            exchange,
            headers: Headers::new(),
            accepted: request.accept_encodings(),
            compression: Encoding::Identity,
            level: None,
            keep_alive: request.is_keep_alive(),
            head_only: request.method().suppresses_body(),
            max_response_size,
            report: ResponseReport::default(),
        }
    }

    /// The connection this response goes to.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Sets a header sent with the response, replacing any earlier value.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Applies `encoding` to the body if the client accepts it. Returns
    /// whether the encoding was selected.
    pub fn set_compression(&mut self, encoding: Encoding) -> bool {
        if encoding::is_acceptable(&self.accepted, encoding) {
            self.compression = encoding;
            true
        } else {
            debug!(peer = %self.peer, %encoding, "client does not accept encoding, sending identity");
            false
        }
    }

    /// Codec-specific level; out-of-range values are clamped.
    pub fn set_compression_level(&mut self, level: i32) -> &mut Self {
        self.level = Some(level);
        self
    }

    pub fn compression(&self) -> Encoding {
        self.compression
    }

    /// A handle that observes what this writer sends.
    pub fn report(&self) -> ResponseReport {
        self.report.clone()
    }

    /// Sends a complete response with `body`.
    pub fn send(self, status: StatusCode, body: impl Into<Bytes>) -> Promise<usize> {
        self.send_response(Response::new(status).body_bytes(body))
    }

    /// Sends a prepared response. Headers set on the writer are sent too;
    /// the response's own headers win on conflict.
    pub fn send_response(mut self, response: Response) -> Promise<usize> {
        if !self.exchange.claim(Phase::Sent) {
            return Promise::rejected(Rejection::new(WriteError::AlreadySent));
        }
        let keep_alive = self.keep_alive && response.is_keep_alive();
        let (status, extra, body, _) = response.into_parts();
        let mut headers = std::mem::take(&mut self.headers);
        for (name, value) in extra.iter() {
            headers.insert(name, value);
        }

        if body.len() > self.max_response_size {
            warn!(
                peer = %self.peer,
                size = body.len(),
                max = self.max_response_size,
                "response too large, sending 500"
            );
            self.queue_status(StatusCode::InternalServerError, keep_alive);
            return Promise::rejected(Rejection::new(WriteError::ResponseTooLarge {
                size: body.len(),
                max: self.max_response_size,
            }));
        }

        let body = if status.forbids_body() {
            Bytes::new()
        } else {
            self.encode(&mut headers, body)
        };
        let body_len = body.len();

        let mut response = Response::new(status).keep_alive(keep_alive).body_bytes(body);
        *response.headers_mut() = headers;
        let mut bytes = response.into_bytes();
        if self.head_only {
            bytes.truncate(bytes.len() - body_len);
        }

        self.report.set_status(status);
        self.report.add_bytes(bytes.len());
        debug!(peer = %self.peer, status = status.as_u16(), bytes = bytes.len(), "response queued");
        self.peer
            .enqueue(bytes.freeze(), FrameEnd::Response { keep_alive })
    }

    /// Sends the file at `path` as a `200 OK` body, as is and without
    /// compression. `Content-Type` is guessed from the extension unless one
    /// was set on the writer.
    ///
    /// A missing file answers `404 Not Found`, any other failure to open it
    /// `500`; the promise then rejects with [`WriteError::File`].
    pub fn send_file(mut self, path: impl AsRef<Path>) -> Promise<usize> {
        if !self.exchange.claim(Phase::Sent) {
            return Promise::rejected(Rejection::new(WriteError::AlreadySent));
        }
        let path = path.as_ref();
        let keep_alive = self.keep_alive;

        let (file, len) = match open_regular(path) {
            Ok(opened) => opened,
            Err(e) => {
                let status = if e.kind() == io::ErrorKind::NotFound {
                    StatusCode::NotFound
                } else {
                    StatusCode::InternalServerError
                };
                debug!(peer = %self.peer, path = %path.display(), error = %e, "cannot serve file");
                self.queue_status(status, keep_alive);
                return Promise::rejected(Rejection::new(WriteError::File(e)));
            }
        };
        let size = usize::try_from(len).unwrap_or(usize::MAX);
        if size > self.max_response_size {
            warn!(
                peer = %self.peer,
                size,
                max = self.max_response_size,
                "file too large, sending 500"
            );
            self.queue_status(StatusCode::InternalServerError, keep_alive);
            return Promise::rejected(Rejection::new(WriteError::ResponseTooLarge {
                size,
                max: self.max_response_size,
            }));
        }

        let mut headers = std::mem::take(&mut self.headers);
        if !headers.contains("content-type") {
            headers.insert("Content-Type", content_type(path));
        }
        headers.remove("content-encoding");
        headers.remove("transfer-encoding");
        headers.insert("Content-Length", len.to_string());
        headers.insert("Connection", if keep_alive { "keep-alive" } else { "close" });
        let mut head = BytesMut::with_capacity(128 + headers.len() * 64);
        write_head(&mut head, StatusCode::Ok, &headers);
        let head = head.freeze();

        self.report.set_status(StatusCode::Ok);
        let end = FrameEnd::Response { keep_alive };
        if self.head_only {
            self.report.add_bytes(head.len());
            return self.peer.enqueue(head, end);
        }
        self.report.add_bytes(head.len() + size);
        debug!(peer = %self.peer, path = %path.display(), bytes = len, "file queued");
        self.peer.enqueue_file(head, FileBody { file, len }, end)
    }

    /// Queues a bodyless response for an exchange this writer has claimed.
    fn queue_status(&self, status: StatusCode, keep_alive: bool) {
        let bytes = Response::new(status)
            .keep_alive(keep_alive)
            .into_bytes()
            .freeze();
        self.report.set_status(status);
        self.report.add_bytes(bytes.len());
        let _ = self
            .peer
            .enqueue(bytes, FrameEnd::Response { keep_alive });
    }

    fn encode(&self, headers: &mut Headers, body: Bytes) -> Bytes {
        if self.compression.is_identity() || body.is_empty() {
            return body;
        }
        match encoding::compress(self.compression, self.level, &body) {
            Ok(encoded) => {
                headers.insert("Content-Encoding", self.compression.as_str());
                headers.insert("Vary", "Accept-Encoding");
                encoded
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "compression failed, sending identity");
                body
            }
        }
    }

    /// Starts a chunked response. The head is queued immediately; the body
    /// follows in one chunk per [`ResponseStream::flush`].
    pub fn stream(mut self, status: StatusCode) -> ResponseStream {
        let claimed = self.exchange.claim(Phase::Streaming);
        let mut headers = std::mem::take(&mut self.headers);

        let compressor = if self.compression.is_identity() {
            None
        } else {
            match Compressor::new(self.compression, self.level) {
                Ok(c) => {
                    headers.insert("Content-Encoding", self.compression.as_str());
                    headers.insert("Vary", "Accept-Encoding");
                    Some(c)
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "compressor setup failed, streaming identity");
                    None
                }
            }
        };
        headers.remove("content-length");
        headers.insert("Transfer-Encoding", "chunked");
        headers.insert(
            "Connection",
            if self.keep_alive { "keep-alive" } else { "close" },
        );

        let stream = ResponseStream {
            peer: Arc::clone(&self.peer),
            compressor,
            buf: BytesMut::new(),
            threshold: DEFAULT_STREAM_THRESHOLD,
            max_size: self.max_response_size,
            streamed: 0,
            keep_alive: self.keep_alive,
            discard: self.head_only,
            ended: !claimed,
            report: self.report.clone(),
        };
        if claimed {
            let mut head = BytesMut::with_capacity(128 + headers.len() * 64);
            write_head(&mut head, status, &headers);
            self.report.set_status(status);
            self.report.add_bytes(head.len());
            let _ = self.peer.enqueue(head.freeze(), FrameEnd::More);
        }
        stream
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if self.exchange.claim(Phase::Sent) {
            warn!(peer = %self.peer, "response writer dropped without a response, sending 500");
            self.queue_status(StatusCode::InternalServerError, false);
        }
    }
}

/// A chunked response body in progress.
///
/// Dropping the stream without calling [`ends`](Self::ends) aborts the
/// connection, since the client could not otherwise tell the body is
/// incomplete. Writing more than the endpoint's `max_response_size` body
/// bytes aborts it too.
pub struct ResponseStream {
    peer: Arc<Peer>,
    compressor: Option<Compressor>,
    buf: BytesMut,
    threshold: usize,
    max_size: usize,
    /// Body bytes accepted so far, before compression.
    streamed: usize,
    keep_alive: bool,
    discard: bool,
    ended: bool,
    report: ResponseReport,
}

impl ResponseStream {
    /// Buffers `data`, flushing once the buffer reaches the threshold.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<(), WriteError> {
        if self.ended {
            return Err(WriteError::StreamEnded);
        }
        if self.peer.is_closed() {
            return Err(SendError::Closed(self.peer.id()).into());
        }
        let data = data.as_ref();
        let size = self.streamed.saturating_add(data.len());
        if size > self.max_size {
            warn!(
                peer = %self.peer,
                size,
                max = self.max_size,
                "streamed response too large, aborting connection"
            );
            self.abort();
            return Err(WriteError::ResponseTooLarge {
                size,
                max: self.max_size,
            });
        }
        self.streamed = size;
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.threshold {
            let flushed = self.flush();
            if let Some(rejection) = flushed.rejection() {
                warn!(peer = %self.peer, error = %rejection, "stream flush failed");
            }
        }
        Ok(())
    }

    /// Sends everything buffered as one chunk.
    pub fn flush(&mut self) -> Promise<usize> {
        if self.ended {
            return Promise::rejected(Rejection::new(WriteError::StreamEnded));
        }
        let data = self.buf.split().freeze();
        let frame = match self.encode(data) {
            Ok(encoded) => chunk(&encoded),
            Err(e) => return Promise::rejected(Rejection::new(e)),
        };
        if frame.is_empty() {
            return Promise::resolved(0);
        }
        self.report.add_bytes(frame.len());
        self.peer.enqueue(frame, FrameEnd::More)
    }

    /// Sends the remaining bytes and the terminating chunk.
    pub fn ends(mut self) -> Promise<usize> {
        if self.ended {
            return Promise::rejected(Rejection::new(WriteError::StreamEnded));
        }
        self.ended = true;

        let data = self.buf.split().freeze();
        let tail = match self.finish(data) {
            Ok(tail) => tail,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to finish stream, aborting connection");
                self.abort();
                return Promise::rejected(Rejection::new(e));
            }
        };

        let mut out = BytesMut::with_capacity(tail.len() + 16);
        out.put(chunk(&tail));
        if !self.discard {
            out.put(&b"0\r\n\r\n"[..]);
        }
        self.report.add_bytes(out.len());
        self.peer.enqueue(
            out.freeze(),
            FrameEnd::Response {
                keep_alive: self.keep_alive,
            },
        )
    }

    pub fn set_flush_threshold(&mut self, threshold: usize) {
        self.threshold = threshold.max(1);
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn report(&self) -> ResponseReport {
        self.report.clone()
    }

    /// Ends the exchange without a terminating chunk and closes the
    /// connection once queued frames are written.
    fn abort(&mut self) {
        self.ended = true;
        self.buf.clear();
        let _ = self
            .peer
            .post(PeerEvent::Close(DisconnectReason::ResponseAborted));
    }

    fn encode(&mut self, data: Bytes) -> Result<Bytes, WriteError> {
        let encoded = match &mut self.compressor {
            Some(c) => {
                c.write(&data)?;
                c.flush()?
            }
            None => data,
        };
        Ok(if self.discard { Bytes::new() } else { encoded })
    }

    fn finish(&mut self, data: Bytes) -> Result<Bytes, WriteError> {
        let encoded = match self.compressor.take() {
            Some(mut c) => {
                c.write(&data)?;
                c.finish()?
            }
            None => data,
        };
        Ok(if self.discard { Bytes::new() } else { encoded })
    }
}

impl io::Write for ResponseStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseStream::write(self, buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match ResponseStream::flush(self).rejection() {
            Some(rejection) => Err(io::Error::other(rejection)),
            None => Ok(()),
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.ended {
            warn!(peer = %self.peer, "response stream dropped before ends(), aborting connection");
            self.abort();
        }
    }
}

fn open_regular(path: &Path) -> io::Result<(std::fs::File, u64)> {
    let file = std::fs::File::open(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
    }
    Ok((file, meta.len()))
}

/// Media type for a file name, by extension.
fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" | "log" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

/// Frames `data` as one chunk; empty input yields no frame, since an empty
/// chunk terminates the body.
fn chunk(data: &[u8]) -> Bytes {
    if data.is_empty() {
        return Bytes::new();
    }
    let mut frame = BytesMut::with_capacity(data.len() + 12);
    frame.put(format!("{:x}\r\n", data.len()).as_bytes());
    frame.put(data);
    frame.put(&b"\r\n"[..]);
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestParser;
    use crate::http::parser::Progress;
    use crate::peer::{self, Outbound};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn request(raw: &str) -> Request {
        let mut parser = RequestParser::new(1 << 20);
        let mut buf = BytesMut::from(raw.as_bytes());
        match parser.parse(&mut buf).unwrap() {
            Progress::Complete(req) => req,
            Progress::Partial => panic!("incomplete request"),
        }
    }

    fn writer(raw: &str, max: usize) -> (ResponseWriter, UnboundedReceiver<PeerEvent>, Arc<Exchange>) {
        let (peer, rx) = peer::detached("127.0.0.1:50000".parse().unwrap());
        let exchange = Arc::new(Exchange::new());
        let w = ResponseWriter::new(peer, Arc::clone(&exchange), &request(raw), max);
        (w, rx, exchange)
    }

    fn frames(rx: &mut UnboundedReceiver<PeerEvent>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PeerEvent::Write(frame) = event {
                out.push(frame);
            }
        }
        out
    }

    fn text(frame: &Outbound) -> String {
        String::from_utf8_lossy(&frame.bytes).into_owned()
    }

    const GET: &str = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    #[test]
    fn send_queues_one_complete_frame() {
        let (w, mut rx, exchange) = writer(GET, usize::MAX);
        let report = w.report();
        let promise = w.send(StatusCode::Ok, "hello");
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(text(&frames[0]).ends_with("\r\n\r\nhello"));
        assert_eq!(frames[0].end, FrameEnd::Response { keep_alive: true });
        assert_eq!(exchange.phase(), Phase::Sent);
        assert_eq!(report.status(), Some(StatusCode::Ok));
        assert_eq!(report.bytes_written(), frames[0].bytes.len());
        assert!(promise.is_pending());
    }

    #[test]
    fn writer_headers_are_merged() {
        let (mut w, mut rx, _) = writer(GET, usize::MAX);
        w.header("X-Trace", "1").header("Content-Type", "text/html");
        w.send_response(Response::new(StatusCode::Ok).header("Content-Type", "text/plain").body("x"));
        let s = text(&frames(&mut rx)[0]);
        assert!(s.contains("X-Trace: 1\r\n"));
        assert!(s.contains("Content-Type: text/plain\r\n"));
        assert!(!s.contains("text/html"));
    }

    #[test]
    fn oversized_body_becomes_500() {
        let (w, mut rx, _) = writer(GET, 4);
        let promise = w.send(StatusCode::Ok, "way too long");
        let rejection = promise.rejection().expect("rejected");
        assert!(matches!(
            rejection.downcast_ref::<WriteError>(),
            Some(WriteError::ResponseTooLarge { size: 12, max: 4 })
        ));
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(text(&frames[0]).starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn dropped_writer_answers_500() {
        let (w, mut rx, _) = writer(GET, usize::MAX);
        drop(w);
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(text(&frames[0]).starts_with("HTTP/1.1 500"));
        assert_eq!(frames[0].end, FrameEnd::Response { keep_alive: false });
    }

    #[test]
    fn second_claim_loses() {
        let (w, mut rx, exchange) = writer(GET, usize::MAX);
        assert!(exchange.claim(Phase::Sent));
        let promise = w.send(StatusCode::Ok, "late");
        assert!(matches!(
            promise.rejection().and_then(|r| r.downcast_ref::<WriteError>().map(|e| matches!(e, WriteError::AlreadySent))),
            Some(true)
        ));
        assert!(frames(&mut rx).is_empty());
    }

    #[test]
    fn head_request_omits_body() {
        let (w, mut rx, _) = writer("HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", usize::MAX);
        w.send(StatusCode::Ok, "hidden");
        let s = text(&frames(&mut rx)[0]);
        assert!(s.contains("Content-Length: 6\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn compression_only_when_accepted() {
        let (mut w, _rx, _) = writer("GET / HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n", usize::MAX);
        assert!(!w.set_compression(Encoding::Br));
        assert_eq!(w.compression(), Encoding::Identity);
        assert!(w.set_compression(Encoding::Gzip));
    }

    #[test]
    fn compressed_send_sets_content_encoding() {
        let (mut w, mut rx, _) = writer("GET / HTTP/1.1\r\nAccept-Encoding: deflate\r\n\r\n", usize::MAX);
        w.set_compression(Encoding::Deflate);
        w.set_compression_level(9);
        w.send(StatusCode::Ok, "a".repeat(1000));
        let frame = &frames(&mut rx)[0];
        let s = text(frame);
        assert!(s.contains("Content-Encoding: deflate\r\n"));
        assert!(frame.bytes.len() < 500);
    }

    #[test]
    fn stream_frames_each_flush_as_a_chunk() {
        let (w, mut rx, exchange) = writer(GET, usize::MAX);
        let mut stream = w.stream(StatusCode::Ok);
        assert_eq!(exchange.phase(), Phase::Streaming);
        stream.write("Hello ").unwrap();
        stream.flush();
        stream.write("world").unwrap();
        stream.flush();
        stream.write("!").unwrap();
        stream.ends();

        let frames = frames(&mut rx);
        let all: Vec<String> = frames.iter().map(text).collect();
        assert!(all[0].contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(all[1], "6\r\nHello \r\n");
        assert_eq!(all[2], "5\r\nworld\r\n");
        assert_eq!(all[3], "1\r\n!\r\n0\r\n\r\n");
        assert_eq!(frames[3].end, FrameEnd::Response { keep_alive: true });
    }

    #[test]
    fn empty_flush_sends_nothing() {
        let (w, mut rx, _) = writer(GET, usize::MAX);
        let mut stream = w.stream(StatusCode::Ok);
        assert_eq!(stream.flush().value(), Some(0));
        stream.ends();
        assert_eq!(frames(&mut rx).len(), 2);
    }

    #[test]
    fn dropped_stream_aborts() {
        let (w, mut rx, _) = writer(GET, usize::MAX);
        let mut stream = w.stream(StatusCode::Ok);
        stream.write("partial").unwrap();
        drop(stream);
        let mut aborted = false;
        while let Ok(event) = rx.try_recv() {
            if let PeerEvent::Close(DisconnectReason::ResponseAborted) = event {
                aborted = true;
            }
        }
        assert!(aborted);
    }

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("keel-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn send_file_queues_head_and_file_in_one_frame() {
        let path = temp_file("page.html", b"<h1>hi</h1>");
        let (w, mut rx, exchange) = writer(GET, usize::MAX);
        let report = w.report();
        w.send_file(&path);
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        let head = text(&frames[0]);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(head.contains("Content-Length: 11\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(frames[0].file.as_ref().map(|f| f.len), Some(11));
        assert_eq!(exchange.phase(), Phase::Sent);
        assert_eq!(report.bytes_written(), frames[0].bytes.len() + 11);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_answers_404() {
        let (w, mut rx, _) = writer(GET, usize::MAX);
        let promise = w.send_file("/definitely/not/here.txt");
        assert!(matches!(
            promise.rejection().and_then(|r| r.downcast_ref::<WriteError>().map(|e| matches!(e, WriteError::File(_)))),
            Some(true)
        ));
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(text(&frames[0]).starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(frames[0].file.is_none());
    }

    #[test]
    fn head_request_for_a_file_sends_only_the_head() {
        let path = temp_file("data.bin", &[0u8; 32]);
        let (w, mut rx, _) = writer("HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", usize::MAX);
        w.send_file(&path);
        let frames = frames(&mut rx);
        assert!(text(&frames[0]).contains("Content-Type: application/octet-stream\r\n"));
        assert!(frames[0].file.is_none());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn stream_past_the_size_limit_aborts() {
        let (w, mut rx, _) = writer(GET, 8);
        let mut stream = w.stream(StatusCode::Ok);
        stream.write("12345").unwrap();
        let err = stream.write("6789").unwrap_err();
        assert!(matches!(err, WriteError::ResponseTooLarge { size: 9, max: 8 }));
        assert!(stream.is_ended());
        assert!(matches!(stream.write("x"), Err(WriteError::StreamEnded)));
        drop(stream);

        let mut closes = 0;
        let mut terminated = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                PeerEvent::Close(DisconnectReason::ResponseAborted) => closes += 1,
                PeerEvent::Write(frame) => terminated |= frame.bytes.ends_with(b"0\r\n\r\n"),
                _ => {}
            }
        }
        assert_eq!(closes, 1);
        assert!(!terminated);
    }

    #[test]
    fn stream_threshold_flushes_automatically() {
        let (w, mut rx, _) = writer(GET, usize::MAX);
        let mut stream = w.stream(StatusCode::Ok);
        stream.set_flush_threshold(4);
        stream.write("abcdef").unwrap();
        assert_eq!(frames(&mut rx).len(), 2);
        stream.ends();
    }
}
