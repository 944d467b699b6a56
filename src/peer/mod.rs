//! One accepted client connection.
//!
//! A [`Peer`] is shared between its transport's registry, the connection task
//! that owns the socket, and any [`ResponseWriter`](crate::http::ResponseWriter)
//! a handler holds. All socket I/O happens on the connection task; everything
//! else talks to it by posting [`PeerEvent`]s.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::net::Address;
use crate::promise::{Promise, Rejection};
use crate::timeout::{TimeoutKind, Timeouts};
use crate::transport::TransportShared;

/// Process-unique peer identifier.
pub type PeerId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Errors settling the promise of a write to a peer.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("connection to peer {0} is closed")]
    Closed(PeerId),

    #[error("write to peer {peer} failed: {source}")]
    Io {
        peer: PeerId,
        #[source]
        source: Arc<io::Error>,
    },
}

/// Why a connection ended.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// The client closed its side.
    Eof,
    /// The response carried `Connection: close`.
    ConnectionClose,
    Timeout(TimeoutKind),
    /// The request could not be parsed; an error response was sent.
    Malformed(String),
    Io(Arc<io::Error>),
    /// A streamed response was dropped before it was ended.
    ResponseAborted,
    HandlerPanicked,
    /// [`Peer::close`] was called.
    Requested,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("closed by peer"),
            Self::ConnectionClose => f.write_str("connection: close"),
            Self::Timeout(kind) => write!(f, "{kind} timeout"),
            Self::Malformed(reason) => write!(f, "malformed request: {reason}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ResponseAborted => f.write_str("response stream aborted"),
            Self::HandlerPanicked => f.write_str("handler panicked"),
            Self::Requested => f.write_str("close requested"),
            Self::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// What the connection task does once an outbound frame is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameEnd {
    /// More frames of the same response follow, or the frame is raw data.
    More,
    /// The frame completes the in-flight response.
    Response { keep_alive: bool },
}

/// An open file whose first `len` bytes follow a frame's bytes on the wire.
#[derive(Debug)]
pub(crate) struct FileBody {
    pub file: std::fs::File,
    pub len: u64,
}

/// Bytes queued for the socket.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub bytes: Bytes,
    pub file: Option<FileBody>,
    pub done: Option<Promise<usize>>,
    pub end: FrameEnd,
}

impl Outbound {
    pub fn reject(self, error: SendError) {
        if let Some(done) = self.done {
            done.reject(Rejection::new(error));
        }
    }
}

/// Work posted to a connection task.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    Write(Outbound),
    Timeout(TimeoutKind),
    Close(DisconnectReason),
}

type DataStore = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// A connected client.
pub struct Peer {
    id: PeerId,
    address: Address,
    remote: SocketAddr,
    hostname: OnceLock<String>,
    idle: AtomicBool,
    closed: AtomicBool,
    data: Mutex<DataStore>,
    tls: OnceLock<Arc<dyn Any + Send + Sync>>,
    timeouts: Timeouts,
    events: mpsc::UnboundedSender<PeerEvent>,
    transport: Weak<TransportShared>,
}

impl Peer {
    pub(crate) fn new(
        remote: SocketAddr,
        transport: Weak<TransportShared>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            address: Address::from(remote),
            remote,
            hostname: OnceLock::new(),
            idle: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            data: Mutex::new(HashMap::new()),
            tls: OnceLock::new(),
            timeouts: Timeouts::default(),
            events,
            transport,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// The client's host name, computed on first use.
    ///
    /// No reverse lookup is made; this is the textual IP address.
    pub fn hostname(&self) -> &str {
        self.hostname.get_or_init(|| self.remote.ip().to_string())
    }

    /// `true` while no request is in flight.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the peer closed. Returns `true` for the first caller only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Id of the transport serving this peer, while it is running.
    pub fn transport_id(&self) -> Option<usize> {
        self.transport.upgrade().map(|t| t.id())
    }

    /// Attaches `value` under `name`, replacing any earlier value.
    pub fn put_data<T>(&self, name: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.data_store().insert(name.into(), Arc::new(value));
    }

    /// Returns the value stored under `name` if it has type `T`.
    pub fn get_data<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.data_store().get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn remove_data(&self, name: &str) -> bool {
        self.data_store().remove(name).is_some()
    }

    fn data_store(&self) -> std::sync::MutexGuard<'_, DataStore> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches an opaque TLS session. Only the first call has any effect.
    pub fn set_tls_context(&self, context: Arc<dyn Any + Send + Sync>) -> bool {
        self.tls.set(context).is_ok()
    }

    pub fn tls_context(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.tls.get()
    }

    pub(crate) fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Queues raw bytes for the socket. The promise resolves with the number
    /// of bytes written once they are all handed to the kernel.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Promise<usize> {
        self.enqueue(bytes.into(), FrameEnd::More)
    }

    /// Asks the connection task to close the connection.
    pub fn close(&self) {
        let _ = self.post(PeerEvent::Close(DisconnectReason::Requested));
    }

    pub(crate) fn enqueue(&self, bytes: Bytes, end: FrameEnd) -> Promise<usize> {
        self.enqueue_frame(bytes, None, end)
    }

    /// Queues `head` followed by the contents of `file`. The promise resolves
    /// with the combined length.
    pub(crate) fn enqueue_file(&self, head: Bytes, file: FileBody, end: FrameEnd) -> Promise<usize> {
        self.enqueue_frame(head, Some(file), end)
    }

    fn enqueue_frame(&self, bytes: Bytes, file: Option<FileBody>, end: FrameEnd) -> Promise<usize> {
        let done = Promise::new();
        let frame = Outbound {
            bytes,
            file,
            done: Some(done.clone()),
            end,
        };
        match self.post(PeerEvent::Write(frame)) {
            Ok(()) => done,
            Err(PeerEvent::Write(frame)) => {
                frame.reject(SendError::Closed(self.id));
                done
            }
            Err(_) => done,
        }
    }

    /// Hands an event to the connection task, returning it if the task is gone.
    pub(crate) fn post(&self, event: PeerEvent) -> Result<(), PeerEvent> {
        self.events.send(event).map_err(|e| e.0)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("idle", &self.is_idle())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.remote)
    }
}

#[cfg(test)]
pub(crate) fn detached(remote: SocketAddr) -> (Arc<Peer>, mpsc::UnboundedReceiver<PeerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Peer::new(remote, Weak::new(), tx)), rx)
}
