//! # keel
//!
//! A multi-threaded HTTP/1.1 server transport.
//!
//! An [`Endpoint`] accepts connections and spreads them over a pool of
//! [`Transport`](transport::Transport) threads, each running its own
//! single-threaded reactor. Requests are parsed incrementally, guarded by
//! header, body and keep-alive timeouts, and handed to a [`Handler`] together
//! with a [`ResponseWriter`](http::ResponseWriter) that can answer at once,
//! later from another thread, or as a compressed chunked stream. Completion
//! of every write is reported through a [`Promise`](promise::Promise).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keel::{Endpoint, Request, StatusCode};
//! use keel::http::ResponseWriter;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut endpoint = Endpoint::new("127.0.0.1:8080".parse()?);
//!     endpoint.set_handler(|_req: Request, writer: ResponseWriter| {
//!         writer.send(StatusCode::Ok, "Hello, World!");
//!     });
//!     endpoint.init(Endpoint::options().threads(4))?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     endpoint.serve()?;
//!     Ok(())
//! }
//! ```

pub mod endpoint;
pub mod handler;
pub mod http;
pub mod net;
pub mod peer;
pub mod promise;
pub mod timeout;
pub mod transport;

pub use endpoint::{Endpoint, Options, ServerError};
pub use handler::{Handler, service_fn};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use net::Address;
pub use peer::Peer;
