//! Bind targets and remote endpoints.
//!
//! An [`Address`] is an immutable `(host, port, family)` triple. It is validated
//! when it is built, so an `Address` that exists is always usable as a bind
//! target or as the description of a connected peer.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while building or resolving an [`Address`].
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid port literal {0:?}")]
    InvalidPort(String),

    #[error("host must not be empty")]
    EmptyHost,

    #[error("malformed address {0:?}")]
    Malformed(String),

    #[error("unix socket path must not be empty")]
    EmptyPath,

    #[error("{0} cannot be resolved to a socket address")]
    Unresolvable(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// Address family of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
    Unix,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V4 => "inet",
            Self::V6 => "inet6",
            Self::Unix => "unix",
        })
    }
}

/// A bind target or a remote endpoint.
///
/// # Examples
///
/// ```
/// use keel::net::{Address, Family};
///
/// let addr: Address = "127.0.0.1:8080".parse().unwrap();
/// assert_eq!(addr.host(), "127.0.0.1");
/// assert_eq!(addr.port(), 8080);
/// assert_eq!(addr.family(), Family::V4);
///
/// let v6: Address = "[::1]:0".parse().unwrap();
/// assert_eq!(v6.family(), Family::V6);
/// assert!("localhost:99999".parse::<Address>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: u16,
    family: Family,
}

impl Address {
    /// Builds an address from a host and a port. The family is inferred from the
    /// host: IP literals carry their own family, names default to IPv4.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_owned)
            .unwrap_or(host);

        if host.is_empty() {
            return Err(AddressError::EmptyHost);
        }

        let family = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => Family::V4,
            Ok(IpAddr::V6(_)) => Family::V6,
            Err(_) if host.contains(':') => return Err(AddressError::Malformed(host)),
            Err(_) => Family::V4,
        };

        Ok(Self { host, port, family })
    }

    /// Wildcard IPv4 address (`0.0.0.0`).
    pub fn any_v4(port: u16) -> Self {
        Self::from(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
    }

    /// Wildcard IPv6 address (`::`).
    pub fn any_v6(port: u16) -> Self {
        Self::from(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port))
    }

    /// IPv4 loopback (`127.0.0.1`).
    pub fn loopback(port: u16) -> Self {
        Self::from(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port))
    }

    /// A unix domain socket path.
    pub fn unix(path: impl Into<String>) -> Result<Self, AddressError> {
        let path = path.into();
        if path.is_empty() {
            return Err(AddressError::EmptyPath);
        }
        Ok(Self {
            host: path,
            port: 0,
            family: Family::Unix,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Resolves the address to the first matching socket address.
    ///
    /// Names are looked up with the system resolver; results of the address's
    /// family are preferred.
    pub fn resolve(&self) -> Result<SocketAddr, AddressError> {
        if self.family == Family::Unix {
            return Err(AddressError::Unresolvable(self.to_string()));
        }

        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let candidates: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| AddressError::Resolve {
                host: self.host.clone(),
                source,
            })?
            .collect();

        let wants_v6 = self.family == Family::V6;
        candidates
            .iter()
            .find(|a| a.is_ipv6() == wants_v6)
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| AddressError::Unresolvable(self.to_string()))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        let family = if addr.is_ipv4() { Family::V4 } else { Family::V6 };
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            family,
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Self::unix(path);
        }

        // "[v6]:port" keeps the colon-bearing host inside brackets.
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddressError::Malformed(s.to_owned()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p,
                None if tail.is_empty() => "0",
                None => return Err(AddressError::Malformed(s.to_owned())),
            };
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(AddressError::Malformed(s.to_owned()));
            }
            (host, port)
        } else if s.matches(':').count() > 1 {
            // bare IPv6 literal without a port
            (s, "0")
        } else {
            s.split_once(':').unwrap_or((s, "0"))
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(port.to_owned()))?;

        Self::new(host, port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            Family::Unix => write!(f, "unix:{}", self.host),
            Family::V6 => write!(f, "[{}]:{}", self.host, self.port),
            Family::V4 => write!(f, "{}:{}", self.host, self.port),
        }
    }
}
