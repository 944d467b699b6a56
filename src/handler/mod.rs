//! The request handler contract.
//!
//! A [`Handler`] is shared by every transport thread, so it must be
//! `Send + Sync`. `on_request` runs on the transport thread that owns the
//! connection: it should answer quickly or move the [`ResponseWriter`] to
//! other work and answer later.
//!
//! Plain closures `Fn(Request, ResponseWriter)` are handlers, and
//! [`service_fn`] adapts async `Fn(Request) -> Response` functions.

use std::future::Future;
use std::sync::Arc;

use tracing::error;

use crate::http::{Request, Response, ResponseWriter, StatusCode};
use crate::peer::Peer;

pub trait Handler: Send + Sync + 'static {
    /// Handles one complete request. The response is sent through `writer`,
    /// now or later, from any thread.
    fn on_request(&self, request: Request, writer: ResponseWriter);

    /// Called once when a connection ends, after the peer is unregistered.
    fn on_disconnect(&self, _peer: &Arc<Peer>) {}
}

impl<F> Handler for F
where
    F: Fn(Request, ResponseWriter) + Send + Sync + 'static,
{
    fn on_request(&self, request: Request, writer: ResponseWriter) {
        self(request, writer)
    }
}

/// Handler built by [`service_fn`].
pub struct ServiceFn<F> {
    f: F,
}

/// Wraps an async function as a handler.
///
/// Each request's future runs as a task on the transport's runtime; a panic
/// inside it is answered with `500 Internal Server Error`.
///
/// ```rust,no_run
/// use keel::endpoint::{Endpoint, Options};
/// use keel::handler::service_fn;
/// use keel::http::{Response, StatusCode};
///
/// let mut endpoint = Endpoint::new("127.0.0.1:8080".parse()?);
/// endpoint.set_handler(service_fn(|req| async move {
///     Response::new(StatusCode::Ok).body(format!("you asked for {}", req.path()))
/// }));
/// endpoint.init(Options::default())?;
/// endpoint.serve()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    ServiceFn { f }
}

impl<F, Fut> Handler for ServiceFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn on_request(&self, request: Request, writer: ResponseWriter) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("service handler invoked outside a runtime");
            writer.send(StatusCode::InternalServerError, "");
            return;
        };
        let future = (self.f)(request);
        runtime.spawn(async move {
            match tokio::spawn(future).await {
                Ok(response) => {
                    writer.send_response(response);
                }
                Err(e) => {
                    error!(peer = %writer.peer(), error = %e, "service future failed, sending 500");
                    writer.send(StatusCode::InternalServerError, "");
                }
            }
        });
    }
}
