//! HTTP/1.1 protocol types, parsing and response writing.
//!
//! Requests are read with the incremental [`RequestParser`] and answered
//! through a [`ResponseWriter`], either in one piece or as a chunked
//! [`ResponseStream`].

use std::fmt;
use std::str::FromStr;

pub mod encoding;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

pub use encoding::Encoding;
pub use headers::Headers;
pub use parser::{ParseState, RequestParser};
pub use request::{QueryParams, Request, RequestError};
pub use response::Response;
pub use writer::{ResponseReport, ResponseStream, ResponseWriter, WriteError};

macro_rules! status_codes {
    ($($name:ident = $code:literal, $reason:literal;)+) => {
        /// An HTTP response status code.
        ///
        /// ```
        /// use keel::http::StatusCode;
        ///
        /// assert_eq!(StatusCode::RequestTimeout.as_u16(), 408);
        /// assert_eq!(StatusCode::from_u16(413), Some(StatusCode::PayloadTooLarge));
        /// assert_eq!(StatusCode::Ok.to_string(), "200 OK");
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum StatusCode {
            $($name = $code,)+
        }

        impl StatusCode {
            /// Looks up a known status by number.
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)+
                    _ => None,
                }
            }

            /// The reason phrase written on the status line.
            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $(Self::$name => $reason,)+
                }
            }
        }
    };
}

status_codes! {
    Continue = 100, "Continue";
    Ok = 200, "OK";
    Created = 201, "Created";
    Accepted = 202, "Accepted";
    NoContent = 204, "No Content";
    MovedPermanently = 301, "Moved Permanently";
    Found = 302, "Found";
    NotModified = 304, "Not Modified";
    BadRequest = 400, "Bad Request";
    Unauthorized = 401, "Unauthorized";
    Forbidden = 403, "Forbidden";
    NotFound = 404, "Not Found";
    MethodNotAllowed = 405, "Method Not Allowed";
    RequestTimeout = 408, "Request Timeout";
    LengthRequired = 411, "Length Required";
    PayloadTooLarge = 413, "Payload Too Large";
    TooManyRequests = 429, "Too Many Requests";
    RequestHeaderFieldsTooLarge = 431, "Request Header Fields Too Large";
    InternalServerError = 500, "Internal Server Error";
    NotImplemented = 501, "Not Implemented";
    ServiceUnavailable = 503, "Service Unavailable";
    HttpVersionNotSupported = 505, "HTTP Version Not Supported";
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    pub fn is_informational(self) -> bool {
        self.as_u16() < 200
    }

    /// 1xx, 204 and 304 responses never carry a body, whatever the handler
    /// passed in.
    pub fn forbids_body(self) -> bool {
        self.is_informational() || matches!(self, Self::NoContent | Self::NotModified)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

/// A request method. Anything outside the RFC 9110 set is kept verbatim in
/// [`Method::Extension`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
            Self::Extension(name) => name,
        }
    }

    /// Whether the response to this method is sent without a body, even
    /// though its headers describe one.
    pub fn suppresses_body(&self) -> bool {
        matches!(self, Self::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    /// Method names are case-sensitive; `get` is an extension method.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "CONNECT" => Self::Connect,
            "OPTIONS" => Self::Options,
            "TRACE" => Self::Trace,
            "PATCH" => Self::Patch,
            other => Self::Extension(other.to_owned()),
        })
    }
}
