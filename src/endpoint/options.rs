//! Endpoint configuration.

use std::ops::BitOr;
use std::time::Duration;

use serde::Deserialize;

use crate::timeout::TimeoutKind;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Default maximum size of a complete request, head and body (4 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 4 * 1024 * 1024;

/// Socket flags applied to the listener and to accepted connections.
///
/// ```
/// use keel::endpoint::Flags;
///
/// let flags = Flags::REUSE_ADDR | Flags::NO_DELAY;
/// assert!(flags.reuse_addr && flags.no_delay && !flags.reuse_port);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Flags {
    pub reuse_addr: bool,
    /// `SO_REUSEPORT`; ignored on platforms without it.
    pub reuse_port: bool,
    /// `TCP_NODELAY` on every accepted connection.
    pub no_delay: bool,
}

impl Flags {
    pub const NONE: Self = Self {
        reuse_addr: false,
        reuse_port: false,
        no_delay: false,
    };
    pub const REUSE_ADDR: Self = Self {
        reuse_addr: true,
        ..Self::NONE
    };
    pub const REUSE_PORT: Self = Self {
        reuse_port: true,
        ..Self::NONE
    };
    pub const NO_DELAY: Self = Self {
        no_delay: true,
        ..Self::NONE
    };
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            reuse_addr: self.reuse_addr || rhs.reuse_addr,
            reuse_port: self.reuse_port || rhs.reuse_port,
            no_delay: self.no_delay || rhs.no_delay,
        }
    }
}

/// Tuning for an [`Endpoint`](super::Endpoint).
///
/// Built fluently from [`Endpoint::options`](super::Endpoint::options) or
/// loaded from JSON, where timeouts are given in milliseconds and `0` or
/// `null` disables them:
///
/// ```
/// use std::time::Duration;
/// use keel::endpoint::Options;
///
/// let opts = Options::from_json(r#"{ "threads": 4, "header_timeout_ms": 500 }"#).unwrap();
/// assert_eq!(opts.thread_count(), 4);
/// assert_eq!(opts.header_timeout(), Some(Duration::from_millis(500)));
/// assert_eq!(opts.keepalive_timeout(), None);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    threads: usize,
    flags: Flags,
    backlog: u32,
    #[serde(rename = "header_timeout_ms", with = "millis")]
    header_timeout: Option<Duration>,
    #[serde(rename = "body_timeout_ms", with = "millis")]
    body_timeout: Option<Duration>,
    #[serde(rename = "keepalive_timeout_ms", with = "millis")]
    keepalive_timeout: Option<Duration>,
    max_request_size: usize,
    max_response_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threads: 1,
            flags: Flags::NONE,
            backlog: DEFAULT_BACKLOG,
            header_timeout: None,
            body_timeout: None,
            keepalive_timeout: None,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            max_response_size: usize::MAX,
        }
    }
}

impl Options {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Number of transport threads.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Time allowed from the first byte of a request to the end of its head.
    #[must_use]
    pub fn header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = Some(timeout);
        self
    }

    /// Time allowed from the end of the head to the end of the body.
    #[must_use]
    pub fn body_timeout(mut self, timeout: Duration) -> Self {
        self.body_timeout = Some(timeout);
        self
    }

    /// Time an idle keep-alive connection is kept open.
    #[must_use]
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    /// Largest buffered response body; bigger ones are answered with `500`.
    #[must_use]
    pub fn max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = bytes;
        self
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }

    pub fn socket_flags(&self) -> Flags {
        self.flags
    }

    pub fn listen_backlog(&self) -> u32 {
        self.backlog
    }

    pub fn timeout(&self, kind: TimeoutKind) -> Option<Duration> {
        match kind {
            TimeoutKind::Header => self.header_timeout,
            TimeoutKind::Body => self.body_timeout,
            TimeoutKind::Keepalive => self.keepalive_timeout,
        }
    }

    pub fn request_size_limit(&self) -> usize {
        self.max_request_size
    }

    pub fn response_size_limit(&self) -> usize {
        self.max_response_size
    }

    /// Checks the values `init` cannot work with.
    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.threads == 0 {
            return Err("threads must be at least 1");
        }
        if self.backlog == 0 {
            return Err("backlog must be at least 1");
        }
        if self.max_request_size == 0 {
            return Err("max_request_size must be non-zero");
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let o = Options::default();
        assert_eq!(o.thread_count(), 1);
        assert_eq!(o.listen_backlog(), 1024);
        assert_eq!(o.request_size_limit(), 4 * 1024 * 1024);
        assert_eq!(o.response_size_limit(), usize::MAX);
        assert_eq!(o.socket_flags(), Flags::NONE);
        for kind in [TimeoutKind::Header, TimeoutKind::Body, TimeoutKind::Keepalive] {
            assert_eq!(o.timeout(kind), None);
        }
    }

    #[test]
    fn builder_sets_every_field() {
        let o = Options::default()
            .threads(4)
            .flags(Flags::REUSE_ADDR | Flags::REUSE_PORT)
            .backlog(16)
            .header_timeout(Duration::from_millis(100))
            .body_timeout(Duration::from_millis(200))
            .keepalive_timeout(Duration::from_secs(1))
            .max_request_size(1024)
            .max_response_size(2048);
        assert_eq!(o.thread_count(), 4);
        assert!(o.socket_flags().reuse_port);
        assert_eq!(o.listen_backlog(), 16);
        assert_eq!(o.timeout(TimeoutKind::Body), Some(Duration::from_millis(200)));
        assert_eq!(o.timeout(TimeoutKind::Keepalive), Some(Duration::from_secs(1)));
        assert_eq!(o.request_size_limit(), 1024);
        assert_eq!(o.response_size_limit(), 2048);
        assert!(o.validate().is_ok());
    }

    #[test]
    fn json_flags_and_zero_timeouts() {
        let o = Options::from_json(
            r#"{"flags": {"no_delay": true}, "body_timeout_ms": 0, "keepalive_timeout_ms": 2500}"#,
        )
        .unwrap();
        assert_eq!(o.socket_flags(), Flags::NO_DELAY);
        assert_eq!(o.timeout(TimeoutKind::Body), None);
        assert_eq!(o.timeout(TimeoutKind::Keepalive), Some(Duration::from_millis(2500)));
        assert_eq!(o.thread_count(), 1);
    }

    #[test]
    fn zero_threads_is_invalid() {
        assert!(Options::default().threads(0).validate().is_err());
    }
}
