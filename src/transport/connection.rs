//! The per-connection task.
//!
//! Each accepted socket is driven by one task on its transport's runtime. The
//! task reads and parses requests, dispatches complete ones to the handler,
//! writes queued response frames in order, and reacts to timeouts and close
//! requests. It stops reading while a request is in flight, so pipelined
//! requests are answered one at a time, in order.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::TransportShared;
use crate::http::parser::{self, Progress};
use crate::http::writer::{Exchange, Phase};
use crate::http::{ParseState, Request, RequestError, RequestParser, Response, ResponseWriter, StatusCode};
use crate::peer::{DisconnectReason, FileBody, FrameEnd, Outbound, Peer, PeerEvent, SendError};
use crate::promise::Rejection;
use crate::timeout::{Disarm, TimeoutKind};

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Upper bound on the graceful socket shutdown when a connection ends.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

pub(crate) async fn drive(
    shared: Arc<TransportShared>,
    peer: Arc<Peer>,
    stream: TcpStream,
    events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    let parser = RequestParser::new(shared.options().request_size_limit());
    let mut conn = Connection {
        shared,
        peer,
        stream,
        events,
        buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        parser,
        exchange: None,
        between_requests: false,
    };
    let reason = conn.run().await;
    conn.finish(reason).await;
}

struct Connection {
    shared: Arc<TransportShared>,
    peer: Arc<Peer>,
    stream: TcpStream,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    buf: BytesMut,
    parser: RequestParser,
    /// The request currently dispatched to the handler.
    exchange: Option<Arc<Exchange>>,
    /// A response completed on a keep-alive connection and the next request
    /// has not started yet.
    between_requests: bool,
}

impl Connection {
    async fn run(&mut self) -> DisconnectReason {
        loop {
            let reading = self.exchange.is_none();
            tokio::select! {
                biased;
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return DisconnectReason::Shutdown;
                    };
                    if let Some(reason) = self.on_event(event).await {
                        return reason;
                    }
                }
                read = self.stream.read_buf(&mut self.buf), if reading => match read {
                    Ok(0) => return DisconnectReason::Eof,
                    Ok(_) => {
                        if let Some(reason) = self.on_readable().await {
                            return reason;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return DisconnectReason::Io(Arc::new(e)),
                },
            }
        }
    }

    async fn on_event(&mut self, event: PeerEvent) -> Option<DisconnectReason> {
        match event {
            PeerEvent::Write(frame) => self.on_writable(frame).await,
            PeerEvent::Timeout(kind) => Some(self.on_timeout(kind).await),
            PeerEvent::Close(reason) => Some(reason),
        }
    }

    async fn on_readable(&mut self) -> Option<DisconnectReason> {
        if self.between_requests {
            // Line breaks after a message do not start the next one.
            if !parser::skip_line_breaks(&mut self.buf) {
                return None;
            }
            self.between_requests = false;
            if self.peer.timeouts().disarm(TimeoutKind::Keepalive) == Disarm::AlreadyFired {
                // The queued keep-alive expiry closes the connection.
                return None;
            }
            self.shared.arm(&self.peer, TimeoutKind::Header);
        }
        self.process().await
    }

    /// Parses buffered bytes and dispatches the first complete request.
    async fn process(&mut self) -> Option<DisconnectReason> {
        while self.exchange.is_none() && !self.buf.is_empty() {
            let before = self.parser.state();
            match self.parser.parse(&mut self.buf) {
                Ok(Progress::Partial) => {
                    if before != ParseState::AwaitingBody
                        && self.parser.state() == ParseState::AwaitingBody
                    {
                        return self.on_headers().await;
                    }
                    return None;
                }
                Ok(Progress::Complete(request)) => {
                    if !self.request_timers_disarmed() {
                        return None;
                    }
                    if let Some(reason) = self.dispatch(request) {
                        return Some(reason);
                    }
                }
                Err(e) => return Some(self.reject(e).await),
            }
        }
        None
    }

    /// The head is complete and a body is expected.
    async fn on_headers(&mut self) -> Option<DisconnectReason> {
        if self.peer.timeouts().disarm(TimeoutKind::Header) == Disarm::AlreadyFired {
            return None;
        }
        self.shared.arm(&self.peer, TimeoutKind::Body);
        if self.parser.head().is_some_and(Request::expects_continue) {
            debug!(peer = %self.peer, "sending 100 Continue");
            if let Err(e) = self.stream.write_all(CONTINUE).await {
                return Some(DisconnectReason::Io(Arc::new(e)));
            }
        }
        None
    }

    /// Cancels the header and body timers once a request is complete. Returns
    /// `false` if either already fired; its expiry wins and the request is
    /// dropped.
    fn request_timers_disarmed(&self) -> bool {
        let timeouts = self.peer.timeouts();
        let header = timeouts.disarm(TimeoutKind::Header);
        let body = timeouts.disarm(TimeoutKind::Body);
        header != Disarm::AlreadyFired && body != Disarm::AlreadyFired
    }

    fn dispatch(&mut self, mut request: Request) -> Option<DisconnectReason> {
        request.set_remote(self.peer.remote_addr());
        let exchange = Arc::new(Exchange::new());
        let writer = ResponseWriter::new(
            Arc::clone(&self.peer),
            Arc::clone(&exchange),
            &request,
            self.shared.options().response_size_limit(),
        );
        self.exchange = Some(Arc::clone(&exchange));
        self.peer.set_idle(false);
        self.shared.request_started();

        debug!(
            peer = %self.peer,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let handler = Arc::clone(self.shared.handler());
        if panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(request, writer))).is_ok() {
            return None;
        }

        match exchange.phase() {
            Phase::Streaming => {
                error!(peer = %self.peer, "handler panicked mid-stream, aborting connection");
                Some(DisconnectReason::HandlerPanicked)
            }
            Phase::Pending => {
                error!(peer = %self.peer, "handler panicked, sending 500");
                if exchange.claim(Phase::Sent) {
                    let bytes = Response::new(StatusCode::InternalServerError)
                        .keep_alive(false)
                        .into_bytes()
                        .freeze();
                    let _ = self
                        .peer
                        .enqueue(bytes, FrameEnd::Response { keep_alive: false });
                }
                None
            }
            Phase::Sent => {
                error!(peer = %self.peer, "handler panicked");
                None
            }
        }
    }

    /// Answers a malformed request and ends the connection.
    async fn reject(&mut self, error: RequestError) -> DisconnectReason {
        let status = error.status();
        warn!(
            peer = %self.peer,
            error = %error,
            status = status.as_u16(),
            "bad request"
        );
        self.peer.timeouts().disarm_all();
        let response = Response::new(status)
            .body(format!("{}: {error}", status.canonical_reason()))
            .keep_alive(false);
        let _ = self.stream.write_all(&response.into_bytes()).await;
        DisconnectReason::Malformed(error.to_string())
    }

    async fn on_writable(&mut self, frame: Outbound) -> Option<DisconnectReason> {
        let Outbound {
            bytes,
            file,
            done,
            end,
        } = frame;
        let written = match self.write_frame(&bytes, file).await {
            Ok(n) => n,
            Err(e) => {
                let e = Arc::new(e);
                if let Some(done) = done {
                    done.reject(Rejection::new(SendError::Io {
                        peer: self.peer.id(),
                        source: Arc::clone(&e),
                    }));
                }
                return Some(DisconnectReason::Io(e));
            }
        };
        if let Some(done) = done {
            done.resolve(written);
        }
        match end {
            FrameEnd::More => None,
            FrameEnd::Response { keep_alive } => self.complete_exchange(keep_alive).await,
        }
    }

    async fn write_frame(&mut self, bytes: &[u8], file: Option<FileBody>) -> io::Result<usize> {
        self.stream.write_all(bytes).await?;
        let Some(FileBody { file, len }) = file else {
            return Ok(bytes.len());
        };
        let mut body = tokio::fs::File::from_std(file).take(len);
        let copied = tokio::io::copy(&mut body, &mut self.stream).await?;
        if copied < len {
            // The head promised `len` bytes; the client cannot recover.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file ended after {copied} of {len} bytes"),
            ));
        }
        Ok(bytes.len() + copied as usize)
    }

    async fn complete_exchange(&mut self, keep_alive: bool) -> Option<DisconnectReason> {
        if self.exchange.take().is_some() {
            self.shared.request_finished();
        }
        self.peer.set_idle(true);
        if !keep_alive {
            return Some(DisconnectReason::ConnectionClose);
        }
        self.between_requests = true;
        self.shared.arm(&self.peer, TimeoutKind::Keepalive);
        if self.buf.is_empty() {
            None
        } else {
            self.on_readable().await
        }
    }

    async fn on_timeout(&mut self, kind: TimeoutKind) -> DisconnectReason {
        if kind.sends_response() {
            debug!(peer = %self.peer, %kind, "request timed out, sending 408");
            let response = Response::new(StatusCode::RequestTimeout).keep_alive(false);
            let _ = self.stream.write_all(&response.into_bytes()).await;
        } else {
            debug!(peer = %self.peer, "keep-alive timeout, closing");
        }
        DisconnectReason::Timeout(kind)
    }

    /// Unregisters the peer, fails every write still queued and closes the
    /// socket.
    async fn finish(mut self, reason: DisconnectReason) {
        if self.exchange.take().is_some() {
            self.shared.request_finished();
        }
        self.shared.remove_peer(&self.peer, &reason);

        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            if let PeerEvent::Write(frame) = event {
                frame.reject(SendError::Closed(self.peer.id()));
            }
        }

        if !matches!(reason, DisconnectReason::Io(_)) {
            let _ = tokio::time::timeout(CLOSE_GRACE, self.stream.shutdown()).await;
        }
    }
}
