//! Incremental HTTP/1.1 request parser.
//!
//! Bytes may arrive in arbitrary pieces; the parser consumes what it can from
//! the connection's buffer and reports whether a full request is available.
//!
//! ```text
//! AwaitingRequestLine ──▶ AwaitingHeaders ──▶ AwaitingBody ──▶ Complete
//!         │                     │                  │
//!         └─────────────────────┴──────────────────┴──▶ Malformed
//! ```
//!
//! The request line and header block are handled by [`httparse`]; the body is
//! framed by `Content-Length` or decoded from `Transfer-Encoding: chunked`.

use bytes::{Buf, BytesMut};

use super::request::{Request, RequestError};

/// Maximum number of headers we support per request.
const MAX_HEADERS: usize = 64;

/// Longest chunk-size or trailer line we accept.
const MAX_LINE: usize = 4096;

/// Where the parser is within the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingRequestLine,
    AwaitingHeaders,
    AwaitingBody,
    Complete,
    Malformed,
}

/// Result of feeding bytes to the parser.
#[derive(Debug)]
pub enum Progress {
    /// More bytes are needed.
    Partial,
    /// A whole request was consumed from the buffer.
    Complete(Request),
}

#[derive(Debug, Clone, Copy)]
enum Chunk {
    Size,
    Data { remaining: usize },
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    None,
    Length { remaining: usize },
    Chunked(Chunk),
}

/// Incremental request parser for one connection.
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    max_size: usize,
    received: usize,
    head: Option<Request>,
    body: BytesMut,
    framing: Framing,
}

impl RequestParser {
    /// Creates a parser that rejects messages larger than `max_size` bytes
    /// (head plus body as received on the wire).
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ParseState::AwaitingRequestLine,
            max_size,
            received: 0,
            head: None,
            body: BytesMut::new(),
            framing: Framing::None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// The parsed head of the message in progress, once headers are complete.
    pub fn head(&self) -> Option<&Request> {
        self.head.as_ref()
    }

    /// Consumes bytes from `buf`.
    ///
    /// On success bytes belonging to the current message are removed from
    /// `buf`; anything after a completed request stays for the next call.
    /// After [`Progress::Complete`] the next call starts a new message.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Progress, RequestError> {
        if self.state == ParseState::Complete {
            self.reset();
        }
        match self.advance(buf) {
            Ok(progress) => Ok(progress),
            Err(e) => {
                self.state = ParseState::Malformed;
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        self.state = ParseState::AwaitingRequestLine;
        self.received = 0;
        self.head = None;
        self.body.clear();
        self.framing = Framing::None;
    }

    fn advance(&mut self, buf: &mut BytesMut) -> Result<Progress, RequestError> {
        loop {
            match self.state {
                ParseState::AwaitingRequestLine | ParseState::AwaitingHeaders => {
                    if !self.parse_head(buf)? {
                        return Ok(Progress::Partial);
                    }
                }
                ParseState::AwaitingBody => {
                    if !self.parse_body(buf)? {
                        return Ok(Progress::Partial);
                    }
                }
                ParseState::Complete => {
                    let mut request = self
                        .head
                        .take()
                        .ok_or(RequestError::MissingField { field: "request line" })?;
                    request.set_body(self.body.split().freeze());
                    return Ok(Progress::Complete(request));
                }
                ParseState::Malformed => {
                    return Err(RequestError::MissingField { field: "request line" });
                }
            }
        }
    }

    // Returns `true` once the head has been consumed.
    fn parse_head(&mut self, buf: &mut BytesMut) -> Result<bool, RequestError> {
        if self.state == ParseState::AwaitingRequestLine {
            skip_line_breaks(buf);
        }
        if buf.is_empty() {
            return Ok(false);
        }

        let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut fields);

        let head_len = match raw.parse(&buf[..])? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > self.max_size {
                    return Err(RequestError::TooLarge {
                        max_bytes: self.max_size,
                    });
                }
                if buf.contains(&b'\n') {
                    self.state = ParseState::AwaitingHeaders;
                }
                return Ok(false);
            }
        };

        let request = Request::from_head(raw.method, raw.path, raw.version, raw.headers)?;
        buf.advance(head_len);
        self.received = head_len;
        if self.received > self.max_size {
            return Err(RequestError::TooLarge {
                max_bytes: self.max_size,
            });
        }

        self.framing = framing_of(&request)?;
        if let Framing::Length { remaining } = self.framing {
            if head_len.saturating_add(remaining) > self.max_size {
                return Err(RequestError::TooLarge {
                    max_bytes: self.max_size,
                });
            }
        }

        self.state = match self.framing {
            Framing::None => ParseState::Complete,
            _ => ParseState::AwaitingBody,
        };
        self.head = Some(request);
        Ok(true)
    }

    // Returns `true` once the body has been consumed.
    fn parse_body(&mut self, buf: &mut BytesMut) -> Result<bool, RequestError> {
        loop {
            match self.framing {
                Framing::None => break,
                Framing::Length { remaining } => {
                    let take = remaining.min(buf.len());
                    self.take_body(buf, take)?;
                    if take < remaining {
                        self.framing = Framing::Length {
                            remaining: remaining - take,
                        };
                        return Ok(false);
                    }
                    break;
                }
                Framing::Chunked(Chunk::Size) => {
                    let Some(line) = self.line(buf)? else {
                        return Ok(false);
                    };
                    let size = chunk_size(&line)?;
                    self.framing = Framing::Chunked(if size == 0 {
                        Chunk::Trailer
                    } else {
                        Chunk::Data { remaining: size }
                    });
                }
                Framing::Chunked(Chunk::Data { remaining }) => {
                    let take = remaining.min(buf.len());
                    self.take_body(buf, take)?;
                    if take < remaining {
                        self.framing = Framing::Chunked(Chunk::Data {
                            remaining: remaining - take,
                        });
                        return Ok(false);
                    }
                    self.framing = Framing::Chunked(Chunk::DataEnd);
                }
                Framing::Chunked(Chunk::DataEnd) => {
                    if buf.len() < 2 {
                        return Ok(false);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(RequestError::InvalidChunk("missing CRLF after chunk data"));
                    }
                    self.consume(buf, 2)?;
                    self.framing = Framing::Chunked(Chunk::Size);
                }
                Framing::Chunked(Chunk::Trailer) => {
                    let Some(line) = self.line(buf)? else {
                        return Ok(false);
                    };
                    // Trailer fields are read and discarded.
                    if line.is_empty() {
                        break;
                    }
                }
            }
        }
        self.framing = Framing::None;
        self.state = ParseState::Complete;
        Ok(true)
    }

    fn take_body(&mut self, buf: &mut BytesMut, len: usize) -> Result<(), RequestError> {
        self.body.extend_from_slice(&buf[..len]);
        self.consume(buf, len)
    }

    fn consume(&mut self, buf: &mut BytesMut, len: usize) -> Result<(), RequestError> {
        buf.advance(len);
        self.received += len;
        if self.received > self.max_size {
            return Err(RequestError::TooLarge {
                max_bytes: self.max_size,
            });
        }
        Ok(())
    }

    // Consumes one CRLF-terminated line, returning it without the terminator.
    fn line(&mut self, buf: &mut BytesMut) -> Result<Option<String>, RequestError> {
        let Some(end) = buf.iter().position(|b| *b == b'\n') else {
            if buf.len() > MAX_LINE {
                return Err(RequestError::InvalidChunk("line too long"));
            }
            return Ok(None);
        };
        let line = std::str::from_utf8(&buf[..end])
            .map_err(|_| RequestError::InvalidChunk("non-UTF-8 line"))?
            .trim_end_matches('\r')
            .to_owned();
        self.consume(buf, end + 1)?;
        Ok(Some(line))
    }
}

/// Drops the stray line breaks clients may send between messages. Returns
/// `true` if anything else is left in `buf`.
pub(crate) fn skip_line_breaks(buf: &mut BytesMut) -> bool {
    let leading = buf.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
    buf.advance(leading);
    !buf.is_empty()
}

fn framing_of(request: &Request) -> Result<Framing, RequestError> {
    let has_length = request.headers().contains("content-length");

    if request.headers().contains("transfer-encoding") {
        if has_length {
            return Err(RequestError::ConflictingFraming);
        }
        if !request.is_chunked() {
            let coding = request
                .headers()
                .list("transfer-encoding")
                .last()
                .unwrap_or_default()
                .to_owned();
            return Err(RequestError::UnsupportedTransferEncoding(coding));
        }
        return Ok(Framing::Chunked(Chunk::Size));
    }

    if has_length {
        let raw = request.headers().get("content-length").unwrap_or_default();
        let length = raw
            .trim()
            .parse::<usize>()
            .map_err(|_| RequestError::InvalidContentLength(raw.to_owned()))?;
        return Ok(if length == 0 {
            Framing::None
        } else {
            Framing::Length { remaining: length }
        });
    }

    Ok(Framing::None)
}

fn chunk_size(line: &str) -> Result<usize, RequestError> {
    let digits = line.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() {
        return Err(RequestError::InvalidChunk("empty chunk size"));
    }
    usize::from_str_radix(digits, 16).map_err(|_| RequestError::InvalidChunk("invalid chunk size"))
}
