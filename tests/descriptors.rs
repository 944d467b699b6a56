//! Runs in its own test binary so no other test opens descriptors meanwhile.

#![cfg(target_os = "linux")]

mod common;

use std::time::Duration;

use common::{Client, open_fds, serve, wait_until};
use keel::endpoint::Options;
use keel::http::{Request, ResponseWriter, StatusCode};

fn bye(_req: Request, writer: ResponseWriter) {
    writer.send(StatusCode::Ok, "bye");
}

/// Runs one endpoint through its whole lifecycle. With tokio's `signal`
/// feature the first runtime that enables IO opens a process-wide socket
/// pair for signal delivery; it stays open for the life of the process.
fn warm_up() {
    let endpoint = serve(bye, Options::default());
    assert_eq!(Client::connect(&endpoint).get("/").text(), "bye");
    endpoint.shutdown();
}

#[test]
fn shutdown_releases_every_descriptor() {
    common::init_tracing();
    warm_up();
    let before = open_fds();

    let endpoint = serve(
        bye,
        Options::default()
            .threads(3)
            .keepalive_timeout(Duration::from_secs(30)),
    );
    let mut clients: Vec<Client> = (0..5).map(|_| Client::connect(&endpoint)).collect();
    for client in &mut clients {
        assert_eq!(client.get("/").text(), "bye");
    }
    assert!(open_fds() > before);

    endpoint.shutdown();
    for client in &mut clients {
        assert!(client.closed_silently());
    }
    drop(clients);
    drop(endpoint);

    assert!(
        wait_until(Duration::from_secs(5), || open_fds() <= before),
        "descriptors before: {before}, after: {}",
        open_fds()
    );
}
