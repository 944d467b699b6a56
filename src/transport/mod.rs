//! I/O workers.
//!
//! A [`Transport`] is one OS thread running its own single-threaded tokio
//! runtime. It owns the sockets of the peers assigned to it, a registry of
//! those peers, and one [`TimerQueue`] for all of their timeouts. Other
//! threads reach it only through its command channel and through
//! [`Peer`] events.

pub(crate) mod connection;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::endpoint::Options;
use crate::handler::Handler;
use crate::peer::{DisconnectReason, Peer, PeerEvent, PeerId};
use crate::timeout::{Entry, TimeoutKind, TimerQueue};

/// How long open connections get to wind down on shutdown before their tasks
/// are cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors produced by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport {0} was already started")]
    AlreadyStarted(usize),

    #[error("transport {0} is not running")]
    NotRunning(usize),

    #[error("failed to start transport: {0}")]
    Runtime(#[source] io::Error),
}

enum Command {
    Assign(std::net::TcpStream, SocketAddr),
    Disconnect(PeerId),
    Shutdown,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State reachable from the transport thread, its peers and the endpoint.
pub(crate) struct TransportShared {
    id: usize,
    handler: Arc<dyn Handler>,
    options: Arc<Options>,
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    timers: TimerQueue,
    in_flight: AtomicUsize,
}

impl TransportShared {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Registers a freshly assigned socket: applies socket options, creates
    /// the peer and arms its header timeout.
    pub fn register_peer(
        self: &Arc<Self>,
        socket: &TcpStream,
        remote: SocketAddr,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<PeerEvent>) {
        if self.options.socket_flags().no_delay {
            if let Err(e) = socket.set_nodelay(true) {
                warn!(transport = self.id, peer = %remote, error = %e, "failed to set TCP_NODELAY");
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer::new(remote, Arc::downgrade(self), tx));
        lock(&self.peers).insert(peer.id(), Arc::clone(&peer));
        self.arm(&peer, TimeoutKind::Header);
        debug!(transport = self.id, peer = %peer, "peer registered");
        (peer, rx)
    }

    /// Unregisters `peer` and notifies the handler. Only the first call for a
    /// given peer has any effect.
    pub fn remove_peer(&self, peer: &Arc<Peer>, reason: &DisconnectReason) {
        if !peer.mark_closed() {
            return;
        }
        peer.timeouts().disarm_all();
        lock(&self.peers).remove(&peer.id());
        debug!(transport = self.id, peer = %peer, %reason, "peer disconnected");

        let handler = Arc::clone(&self.handler);
        if panic::catch_unwind(AssertUnwindSafe(|| handler.on_disconnect(peer))).is_err() {
            error!(transport = self.id, peer = %peer, "disconnect callback panicked");
        }
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        lock(&self.peers).get(&id).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        lock(&self.peers).values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    /// Arms `kind` for `peer` if that timeout is configured.
    pub fn arm(&self, peer: &Peer, kind: TimeoutKind) {
        let Some(after) = self.options.timeout(kind) else {
            return;
        };
        let deadline = Instant::now() + after;
        let generation = peer.timeouts().arm(kind, deadline);
        self.timers.schedule(Entry {
            deadline,
            generation,
            peer: peer.id(),
            kind,
        });
    }

    fn fire(&self, entry: Entry, now: Instant) {
        let Some(peer) = self.peer(entry.peer) else {
            return;
        };
        if peer.timeouts().try_fire(entry.kind, entry.generation, now) {
            debug!(transport = self.id, peer = %peer, kind = %entry.kind, "timeout fired");
            let _ = peer.post(PeerEvent::Timeout(entry.kind));
        }
    }

    pub fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn request_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One I/O worker thread.
pub struct Transport {
    shared: Arc<TransportShared>,
    commands: mpsc::UnboundedSender<Command>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Transport {
    pub fn new(id: usize, handler: Arc<dyn Handler>, options: Arc<Options>) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(TransportShared {
                id,
                handler,
                options,
                peers: Mutex::new(HashMap::new()),
                timers: TimerQueue::new(),
                in_flight: AtomicUsize::new(0),
            }),
            commands,
            inbox: Mutex::new(Some(inbox)),
            thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// [`TransportError::AlreadyStarted`] on a second call, or
    /// [`TransportError::Runtime`] if the runtime or thread cannot be created.
    pub fn start(&self) -> Result<(), TransportError> {
        let Some(inbox) = lock(&self.inbox).take() else {
            return Err(TransportError::AlreadyStarted(self.shared.id));
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("keel-transport-{}", self.shared.id))
            .spawn(move || runtime.block_on(run(shared, inbox)))
            .map_err(TransportError::Runtime)?;
        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    /// Hands an accepted connection to this transport. The stream must be in
    /// non-blocking mode.
    pub fn assign(&self, stream: std::net::TcpStream, remote: SocketAddr) -> Result<(), TransportError> {
        self.commands
            .send(Command::Assign(stream, remote))
            .map_err(|_| TransportError::NotRunning(self.shared.id))
    }

    /// Closes the connection of the given peer, if it is served here.
    pub fn disconnect(&self, peer: PeerId) {
        let _ = self.commands.send(Command::Disconnect(peer));
    }

    /// Closes every connection, stops the worker and waits for it. Safe to
    /// call more than once.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let Some(handle) = lock(&self.thread).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            warn!(transport = self.shared.id, "shutdown requested from the transport's own thread");
            return;
        }
        if handle.join().is_err() {
            error!(transport = self.shared.id, "transport thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peer_count()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.shared.peers()
    }

    /// Requests dispatched to a handler whose response has not completed.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Deadlines currently queued, including stale ones not yet discarded.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(shared: Arc<TransportShared>, mut inbox: mpsc::UnboundedReceiver<Command>) {
    debug!(transport = shared.id, "transport started");
    let (stop, stopped) = watch::channel(false);
    let timers = tokio::spawn(run_timers(Arc::clone(&shared), stopped));
    let mut connections = JoinSet::new();

    while let Some(command) = inbox.recv().await {
        match command {
            Command::Assign(stream, remote) => match TcpStream::from_std(stream) {
                Ok(stream) => {
                    let (peer, events) = shared.register_peer(&stream, remote);
                    connections.spawn(connection::drive(Arc::clone(&shared), peer, stream, events));
                }
                Err(e) => {
                    warn!(transport = shared.id, peer = %remote, error = %e, "failed to register connection");
                }
            },
            Command::Disconnect(id) => {
                if let Some(peer) = shared.peer(id) {
                    let _ = peer.post(PeerEvent::Close(DisconnectReason::Requested));
                }
            }
            Command::Shutdown => break,
        }
        while connections.try_join_next().is_some() {}
    }

    for peer in shared.peers() {
        let _ = peer.post(PeerEvent::Close(DisconnectReason::Shutdown));
    }
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(transport = shared.id, "connections did not close in time, cancelling");
        connections.shutdown().await;
        for peer in shared.peers() {
            shared.remove_peer(&peer, &DisconnectReason::Shutdown);
        }
    }

    let _ = stop.send(true);
    let _ = timers.await;
    debug!(transport = shared.id, "transport stopped");
}

async fn run_timers(shared: Arc<TransportShared>, mut stop: watch::Receiver<bool>) {
    loop {
        let next = shared.timers.next_deadline();
        let sleep = async {
            match next {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = sleep => {}
            _ = shared.timers.rescheduled() => {}
            _ = stop.changed() => break,
        }
        let now = Instant::now();
        for entry in shared.timers.pop_expired(now) {
            shared.fire(entry, now);
        }
    }
}
