mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{Client, serve, wait_until};
use keel::endpoint::Options;
use keel::http::{Request, ResponseWriter, StatusCode};

fn echo(req: Request, writer: ResponseWriter) {
    let body = req.body().clone();
    writer.send(StatusCode::Ok, body);
}

#[test]
fn header_timeout_answers_408() {
    let endpoint = serve(echo, Options::default().header_timeout(Duration::from_millis(300)));
    let mut client = Client::connect(&endpoint);

    let started = Instant::now();
    client.send("GET / HTTP/1.1\r\nHost: local");
    let response = client.response();

    assert_eq!(response.status, 408);
    assert_eq!(response.reason, "Request Timeout");
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(client.read_to_close().is_empty());
}

#[test]
fn header_timeout_covers_a_silent_connection() {
    let endpoint = serve(echo, Options::default().header_timeout(Duration::from_millis(200)));
    let mut client = Client::connect(&endpoint);
    assert_eq!(client.response().status, 408);
}

#[test]
fn body_timeout_answers_408() {
    let endpoint = serve(
        echo,
        Options::default()
            .header_timeout(Duration::from_secs(5))
            .body_timeout(Duration::from_millis(300)),
    );
    let mut client = Client::connect(&endpoint);

    client.send("POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 100\r\n\r\nonly a little");
    let started = Instant::now();
    let response = client.response();

    assert_eq!(response.status, 408);
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn timely_requests_are_not_timed_out() {
    let endpoint = serve(
        echo,
        Options::default()
            .header_timeout(Duration::from_millis(300))
            .body_timeout(Duration::from_millis(300)),
    );
    let mut client = Client::connect(&endpoint);

    client.send("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");
    let response = client.response();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");

    // Idle past both timeouts: they are only armed once a new request starts.
    thread::sleep(Duration::from_millis(600));
    let response = client.get("/again");
    assert_eq!(response.status, 200);
}

#[test]
fn slow_but_timely_pieces_are_not_timed_out() {
    let endpoint = serve(
        echo,
        Options::default()
            .header_timeout(Duration::from_millis(600))
            .body_timeout(Duration::from_millis(600)),
    );
    let mut client = Client::connect(&endpoint);

    thread::sleep(Duration::from_millis(300));
    client.send("POST /slow HTTP/1.1\r\nHost: x\r\nContent-Length: 8\r\n\r\n");
    thread::sleep(Duration::from_millis(300));
    client.send("abcdefgh");

    let response = client.response();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "abcdefgh");
}

#[test]
fn line_breaks_after_a_body_leave_the_connection_idle() {
    let endpoint = serve(echo, Options::default().header_timeout(Duration::from_millis(300)));
    let mut client = Client::connect(&endpoint);

    client.send("POST /ping HTTP/1.1\r\nHost: x\r\nContent-Length: 8\r\n\r\nabcdefgh\r\n\r\n");
    let response = client.response();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "abcdefgh");

    assert!(client.quiet_for(Duration::from_millis(800)));
    assert_eq!(client.get("/next").status, 200);
}

#[test]
fn keepalive_timeout_closes_silently() {
    let endpoint = serve(
        echo,
        Options::default().keepalive_timeout(Duration::from_millis(300)),
    );
    let mut client = Client::connect(&endpoint);
    assert_eq!(client.get("/").status, 200);
    assert_eq!(endpoint.peer_count(), 1);

    assert!(client.closed_silently());
    assert!(wait_until(Duration::from_secs(5), || endpoint.peer_count() == 0));
}

#[test]
fn activity_resets_keepalive() {
    let endpoint = serve(
        echo,
        Options::default().keepalive_timeout(Duration::from_millis(400)),
    );
    let mut client = Client::connect(&endpoint);
    for _ in 0..4 {
        assert_eq!(client.get("/").status, 200);
        thread::sleep(Duration::from_millis(200));
    }
    assert_eq!(endpoint.peer_count(), 1);
}
