//! A small server showing buffered, streamed and async handlers.
//!
//! ```text
//! RUST_LOG=keel=debug cargo run --example hello
//! curl -i http://127.0.0.1:9080/
//! curl -i --compressed http://127.0.0.1:9080/stream
//! curl -i http://127.0.0.1:9080/readme
//! curl -i http://127.0.0.1:9080/async?name=keel
//! ```

use std::thread;
use std::time::Duration;

use keel::endpoint::{Endpoint, Flags};
use keel::handler::Handler;
use keel::http::{Request, Response, ResponseWriter, StatusCode};
use tracing_subscriber::EnvFilter;

struct Hello {
    runtime: tokio::runtime::Handle,
}

impl Handler for Hello {
    fn on_request(&self, req: Request, mut writer: ResponseWriter) {
        match req.path() {
            "/" => {
                writer.send(StatusCode::Ok, "Hello, World!\n");
            }
            "/readme" => {
                writer.send_file("README.md");
            }
            "/stream" => {
                writer.set_compression(req.best_accept_encoding());
                // Blocking work belongs off the transport thread.
                thread::spawn(move || {
                    let mut stream = writer.stream(StatusCode::Ok);
                    for word in ["Hello ", "streamed ", "world", "!\n"] {
                        if stream.write(word).is_err() {
                            return;
                        }
                        stream.flush();
                        thread::sleep(Duration::from_millis(250));
                    }
                    stream.ends();
                });
            }
            "/async" => {
                let name = req.query_param("name").unwrap_or("stranger").to_owned();
                self.runtime.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    writer.send_response(
                        Response::new(StatusCode::Ok).body(format!("Hello, {name}!\n")),
                    );
                });
            }
            _ => {
                writer.send(StatusCode::NotFound, "Not Found\n");
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let background = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let mut endpoint = Endpoint::new("127.0.0.1:9080".parse()?);
    endpoint.set_handler(Hello {
        runtime: background.handle().clone(),
    });
    endpoint.init(
        Endpoint::options()
            .threads(2)
            .flags(Flags::REUSE_ADDR | Flags::NO_DELAY)
            .header_timeout(Duration::from_secs(5))
            .body_timeout(Duration::from_secs(10))
            .keepalive_timeout(Duration::from_secs(30)),
    )?;
    println!("Listening on http://127.0.0.1:9080");
    endpoint.serve()?;
    Ok(())
}
