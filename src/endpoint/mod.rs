//! The listening endpoint.
//!
//! An [`Endpoint`] binds a listener, starts a pool of [`Transport`]s and
//! hands each accepted connection to one of them, round-robin. Accepting
//! runs on a dedicated single-threaded runtime, so the endpoint works from
//! plain synchronous code:
//!
//! ```rust,no_run
//! use keel::endpoint::{Endpoint, Options};
//! use keel::http::{Request, ResponseWriter, StatusCode};
//!
//! let mut endpoint = Endpoint::new("127.0.0.1:9080".parse()?);
//! endpoint.set_handler(|_req: Request, writer: ResponseWriter| {
//!     writer.send(StatusCode::Ok, "Hello, World!");
//! });
//! endpoint.init(Endpoint::options().threads(2))?;
//! endpoint.serve_threaded()?;
//! // ...
//! endpoint.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod options;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use options::{Flags, Options};

use crate::handler::Handler;
use crate::net::{Address, AddressError, Family};
use crate::promise::{Barrier, Promise};
use crate::transport::{Transport, TransportError};

/// Pause after a failed `accept`, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Errors produced by the endpoint.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("unix domain sockets are not supported")]
    UnsupportedFamily,

    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),

    #[error("endpoint is already initialized")]
    AlreadyInitialized,

    #[error("endpoint is not initialized")]
    NotInitialized,

    #[error("endpoint is already serving")]
    AlreadyServing,

    #[error("endpoint was shut down")]
    ShutDown,

    #[error("no handler set")]
    NoHandler,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum State {
    Created,
    Bound(Bound),
    Serving,
    Stopped,
}

struct Bound {
    runtime: Runtime,
    listener: TcpListener,
    options: Options,
}

/// Everything the accept loop owns while serving.
struct Acceptor {
    runtime: Runtime,
    listener: TcpListener,
    transports: Vec<Arc<Transport>>,
    stop: watch::Receiver<bool>,
    stopped: Promise<()>,
}

/// An HTTP/1.1 server endpoint.
pub struct Endpoint {
    address: Address,
    handler: Option<Arc<dyn Handler>>,
    local_addr: Option<SocketAddr>,
    state: Mutex<State>,
    transports: Mutex<Vec<Arc<Transport>>>,
    stop: watch::Sender<bool>,
    stopped: Promise<()>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Endpoint {
    pub fn new(address: Address) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            address,
            handler: None,
            local_addr: None,
            state: Mutex::new(State::Created),
            transports: Mutex::new(Vec::new()),
            stop,
            stopped: Promise::new(),
            worker: Mutex::new(None),
        }
    }

    /// Default options, for fluent configuration.
    pub fn options() -> Options {
        Options::default()
    }

    pub fn set_handler<H: Handler>(&mut self, handler: H) {
        self.handler = Some(Arc::new(handler));
    }

    /// Sets a handler the caller keeps a reference to.
    pub fn set_shared_handler(&mut self, handler: Arc<dyn Handler>) {
        self.handler = Some(handler);
    }

    /// Binds and listens.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address cannot be bound or listened on,
    /// [`ServerError::AlreadyInitialized`] on a second call, and
    /// [`ServerError::UnsupportedFamily`] for Unix-domain addresses.
    pub fn init(&mut self, options: Options) -> Result<(), ServerError> {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !matches!(state, State::Created) {
            return Err(ServerError::AlreadyInitialized);
        }
        options.validate().map_err(ServerError::InvalidOptions)?;
        if self.address.family() == Family::Unix {
            return Err(ServerError::UnsupportedFamily);
        }

        let addr = self.address.resolve()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            bind(addr, &options).map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?
        };
        let local = listener.local_addr()?;
        debug!(address = %local, "endpoint bound");

        self.local_addr = Some(local);
        *state = State::Bound(Bound {
            runtime,
            listener,
            options,
        });
        Ok(())
    }

    /// Serves on the calling thread until [`shutdown`](Self::shutdown) is
    /// called from elsewhere.
    pub fn serve(&self) -> Result<(), ServerError> {
        self.start()?.run();
        Ok(())
    }

    /// Serves on a background thread and returns immediately.
    pub fn serve_threaded(&self) -> Result<(), ServerError> {
        let acceptor = self.start()?;
        let handle = thread::Builder::new()
            .name("keel-acceptor".to_owned())
            .spawn(move || acceptor.run())?;
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    fn start(&self) -> Result<Acceptor, ServerError> {
        let handler = self.handler.clone().ok_or(ServerError::NoHandler)?;
        let mut state = lock(&self.state);
        let Bound {
            runtime,
            listener,
            options,
        } = match std::mem::replace(&mut *state, State::Serving) {
            State::Bound(bound) => bound,
            other => {
                let err = match other {
                    State::Created => ServerError::NotInitialized,
                    State::Serving => ServerError::AlreadyServing,
                    _ => ServerError::ShutDown,
                };
                *state = other;
                return Err(err);
            }
        };

        let options = Arc::new(options);
        let transports: Vec<Arc<Transport>> = (0..options.thread_count())
            .map(|id| Arc::new(Transport::new(id, Arc::clone(&handler), Arc::clone(&options))))
            .collect();
        for transport in &transports {
            if let Err(e) = transport.start() {
                transports.iter().for_each(|t| t.shutdown());
                *state = State::Stopped;
                self.stopped.resolve(());
                return Err(e.into());
            }
        }
        *lock(&self.transports) = transports.clone();

        info!(
            address = %self.address,
            port = self.port().unwrap_or_default(),
            threads = transports.len(),
            "keel listening"
        );
        Ok(Acceptor {
            runtime,
            listener,
            transports,
            stop: self.stop.subscribe(),
            stopped: self.stopped.clone(),
        })
    }

    /// Stops accepting, closes every connection and joins every thread.
    /// Safe to call more than once; also run on drop.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        let previous = std::mem::replace(&mut *lock(&self.state), State::Stopped);
        match previous {
            State::Serving => match lock(&self.worker).take() {
                Some(handle) => {
                    if handle.join().is_err() {
                        error!("acceptor thread panicked");
                    }
                }
                None => Barrier::new(&self.stopped).wait(),
            },
            State::Bound(bound) => drop(bound),
            State::Created | State::Stopped => {}
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The bound address; available after [`init`](Self::init).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    /// `true` while the listener is open.
    pub fn is_bound(&self) -> bool {
        matches!(*lock(&self.state), State::Bound(_) | State::Serving)
    }

    /// Connected peers across every transport.
    pub fn peer_count(&self) -> usize {
        lock(&self.transports).iter().map(|t| t.peer_count()).sum()
    }

    /// The transports started by `serve`, in assignment order.
    pub fn transports(&self) -> Vec<Arc<Transport>> {
        lock(&self.transports).clone()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind(addr: SocketAddr, options: &Options) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    let flags = options.socket_flags();
    socket.set_reuseaddr(flags.reuse_addr)?;
    if flags.reuse_port {
        set_reuseport(&socket)?;
    }
    socket.bind(addr)?;
    socket.listen(options.listen_backlog())
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
fn set_reuseport(socket: &TcpSocket) -> io::Result<()> {
    socket.set_reuseport(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin")))))]
fn set_reuseport(_socket: &TcpSocket) -> io::Result<()> {
    warn!("SO_REUSEPORT is not available on this platform");
    Ok(())
}

impl Acceptor {
    fn run(self) {
        let Acceptor {
            runtime,
            listener,
            transports,
            stop,
            stopped,
        } = self;
        runtime.block_on(accept_loop(listener, &transports, stop));
        for transport in &transports {
            transport.shutdown();
        }
        drop(runtime);
        info!("keel stopped");
        stopped.resolve(());
    }
}

async fn accept_loop(
    listener: TcpListener,
    transports: &[Arc<Transport>],
    mut stop: watch::Receiver<bool>,
) {
    let mut next = 0usize;
    loop {
        let accepted = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        debug!(peer = %remote, "connection accepted");
        let transport = &transports[next % transports.len()];
        next = next.wrapping_add(1);
        let handoff = stream
            .into_std()
            .map_err(ServerError::from)
            .and_then(|stream| transport.assign(stream, remote).map_err(ServerError::from));
        if let Err(e) = handoff {
            warn!(peer = %remote, transport = transport.id(), error = %e, "failed to hand off connection");
        }
    }
}
