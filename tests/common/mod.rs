//! Helpers shared by the integration tests: a tiny blocking HTTP/1.1 client
//! over `std::net::TcpStream` and endpoint setup.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use keel::endpoint::{Endpoint, Options};
use keel::handler::Handler;
use keel::net::Address;

pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Binds a loopback endpoint on an ephemeral port and serves it in the
/// background.
pub fn serve<H: Handler>(handler: H, options: Options) -> Endpoint {
    init_tracing();
    let mut endpoint = Endpoint::new(Address::loopback(0));
    endpoint.set_handler(handler);
    endpoint.init(options).expect("init");
    endpoint.serve_threaded().expect("serve");
    endpoint
}

pub fn connect(endpoint: &Endpoint) -> TcpStream {
    let addr = endpoint.local_addr().expect("bound");
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(READ_TIMEOUT)).expect("timeout");
    stream
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[derive(Debug, Default)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Chunk payloads in arrival order, for chunked bodies.
    pub chunks: Vec<Vec<u8>>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads exactly one response from `stream`, buffering any extra bytes in
/// `pending` for the next call.
pub struct Client {
    pub stream: TcpStream,
    pending: Vec<u8>,
}

impl Client {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub fn connect(endpoint: &Endpoint) -> Self {
        Self::new(connect(endpoint))
    }

    pub fn send(&mut self, raw: impl AsRef<[u8]>) {
        self.stream.write_all(raw.as_ref()).expect("write");
    }

    pub fn get(&mut self, path: &str) -> RawResponse {
        self.send(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"));
        self.response()
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut buf = [0u8; 8192];
        let n = self.stream.read(&mut buf)?;
        self.pending.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn line(&mut self) -> String {
        loop {
            if let Some(pos) = self.pending.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.pending.drain(..pos + 2).collect();
                return String::from_utf8_lossy(&line[..pos]).into_owned();
            }
            assert!(self.fill().expect("read") > 0, "connection closed mid-line");
        }
    }

    fn exact(&mut self, len: usize) -> Vec<u8> {
        while self.pending.len() < len {
            assert!(self.fill().expect("read") > 0, "connection closed mid-body");
        }
        self.pending.drain(..len).collect()
    }

    pub fn response(&mut self) -> RawResponse {
        let status_line = self.line();
        let mut parts = status_line.splitn(3, ' ');
        assert_eq!(parts.next(), Some("HTTP/1.1"), "bad status line {status_line:?}");
        let status = parts.next().and_then(|s| s.parse().ok()).expect("status code");
        let reason = parts.next().unwrap_or_default().to_owned();

        let mut response = RawResponse {
            status,
            reason,
            ..RawResponse::default()
        };
        loop {
            let line = self.line();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').expect("header line");
            response
                .headers
                .push((name.trim().to_owned(), value.trim().to_owned()));
        }

        if response.status < 200 {
            return response;
        }
        if response
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            loop {
                let size_line = self.line();
                let size = usize::from_str_radix(size_line.trim(), 16).expect("chunk size");
                if size == 0 {
                    assert_eq!(self.line(), "");
                    break;
                }
                let chunk = self.exact(size);
                assert_eq!(self.exact(2), b"\r\n");
                response.body.extend_from_slice(&chunk);
                response.chunks.push(chunk);
            }
        } else {
            let len = response
                .header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            response.body = self.exact(len);
        }
        response
    }

    /// Reads until the server closes; returns whatever arrived.
    pub fn read_to_close(&mut self) -> Vec<u8> {
        let mut rest = std::mem::take(&mut self.pending);
        let _ = self.stream.read_to_end(&mut rest);
        rest
    }

    /// `true` if nothing arrives for `period` and the connection stays open.
    pub fn quiet_for(&mut self, period: Duration) -> bool {
        self.stream.set_read_timeout(Some(period)).expect("timeout");
        let mut byte = [0u8; 1];
        let quiet = match self.stream.read(&mut byte) {
            Ok(_) => false,
            Err(e) => matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
        };
        self.stream.set_read_timeout(Some(READ_TIMEOUT)).expect("timeout");
        quiet && self.pending.is_empty()
    }

    /// `true` if the server closed the connection without sending anything.
    pub fn closed_silently(&mut self) -> bool {
        self.read_to_close().is_empty()
    }
}

/// Number of descriptors open in this process.
#[cfg(target_os = "linux")]
pub fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|dir| dir.count())
        .unwrap_or_default()
}
