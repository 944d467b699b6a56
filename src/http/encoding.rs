//! `Content-Encoding` negotiation and the codec transforms applied to
//! response bodies.
//!
//! The codecs themselves come from `flate2`, `brotli` and `zstd`; this module
//! only selects one and drives it, either over a whole buffer or chunk by
//! chunk with a sync-flush after every chunk.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use thiserror::Error;

/// A content coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Identity,
    /// `deflate`: a zlib stream (RFC 1950), as HTTP defines it.
    Deflate,
    Gzip,
    Br,
    Zstd,
}

/// Encodings the server prefers, best first.
const SERVER_PREFERENCE: [Encoding; 4] = [
    Encoding::Zstd,
    Encoding::Br,
    Encoding::Gzip,
    Encoding::Deflate,
];

impl Encoding {
    /// The token used in `Content-Encoding` / `Accept-Encoding`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Deflate => "deflate",
            Self::Gzip => "gzip",
            Self::Br => "br",
            Self::Zstd => "zstd",
        }
    }

    pub fn is_identity(self) -> bool {
        self == Self::Identity
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown content coding {0:?}")]
pub struct UnknownEncoding(pub String);

impl FromStr for Encoding {
    type Err = UnknownEncoding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        [
            ("identity", Self::Identity),
            ("deflate", Self::Deflate),
            ("gzip", Self::Gzip),
            ("x-gzip", Self::Gzip),
            ("br", Self::Br),
            ("zstd", Self::Zstd),
        ]
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(token))
        .map(|(_, encoding)| encoding)
        .ok_or_else(|| UnknownEncoding(token.to_owned()))
    }
}

/// Parses `Accept-Encoding` list elements into `(encoding, weight)` pairs,
/// highest weight first.
///
/// `*` stands for every supported coding not listed explicitly. Codings with a
/// weight of zero and unknown codings are dropped.
pub fn parse_accept_encoding<'a>(elements: impl Iterator<Item = &'a str>) -> Vec<(Encoding, f32)> {
    let mut accepted: Vec<(Encoding, f32)> = Vec::new();
    let mut wildcard = None;

    for element in elements {
        let mut parts = element.split(';');
        let coding = parts.next().unwrap_or_default().trim();
        let weight = parts
            .find_map(|p| p.trim().strip_prefix("q="))
            .map(|q| q.trim().parse::<f32>().unwrap_or(0.0))
            .unwrap_or(1.0);

        if coding == "*" {
            wildcard = Some(weight);
        } else if let Ok(encoding) = coding.parse::<Encoding>() {
            accepted.push((encoding, weight));
        }
    }

    if let Some(weight) = wildcard {
        for encoding in SERVER_PREFERENCE {
            if !accepted.iter().any(|(e, _)| *e == encoding) {
                accepted.push((encoding, weight));
            }
        }
    }

    accepted.retain(|(_, weight)| *weight > 0.0);
    accepted.sort_by(|a, b| b.1.total_cmp(&a.1));
    accepted
}

/// Picks the best encoding: highest client weight, ties broken by server
/// preference. Falls back to identity.
///
/// ```
/// use keel::http::encoding::{negotiate, parse_accept_encoding, Encoding};
///
/// let prefs = parse_accept_encoding("gzip;q=0.5, br, deflate".split(','));
/// assert_eq!(negotiate(&prefs), Encoding::Br);
/// assert_eq!(negotiate(&[]), Encoding::Identity);
/// ```
pub fn negotiate(accepted: &[(Encoding, f32)]) -> Encoding {
    let mut best: Option<(Encoding, f32)> = None;
    for encoding in SERVER_PREFERENCE {
        let Some(&(_, weight)) = accepted.iter().find(|(e, _)| *e == encoding) else {
            continue;
        };
        if best.is_none_or(|(_, w)| weight > w) {
            best = Some((encoding, weight));
        }
    }
    best.map_or(Encoding::Identity, |(e, _)| e)
}

/// Returns `true` if `encoding` may be sent to a client with these preferences.
pub fn is_acceptable(accepted: &[(Encoding, f32)], encoding: Encoding) -> bool {
    encoding.is_identity() || accepted.iter().any(|(e, _)| *e == encoding)
}

enum Codec {
    Identity(Vec<u8>),
    Deflate(ZlibEncoder<Vec<u8>>),
    Gzip(GzEncoder<Vec<u8>>),
    Br(Box<brotli::CompressorWriter<Vec<u8>>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

/// An incremental compression transform.
///
/// `level` is interpreted per codec and clamped to its valid range; `None`
/// selects the codec's default.
pub struct Compressor {
    encoding: Encoding,
    codec: Codec,
}

impl Compressor {
    pub fn new(encoding: Encoding, level: Option<i32>) -> io::Result<Self> {
        let codec = match encoding {
            Encoding::Identity => Codec::Identity(Vec::new()),
            Encoding::Deflate => Codec::Deflate(ZlibEncoder::new(Vec::new(), flate_level(level))),
            Encoding::Gzip => Codec::Gzip(GzEncoder::new(Vec::new(), flate_level(level))),
            Encoding::Br => {
                let quality = level.map_or(5, |l| l.clamp(0, 11)) as u32;
                Codec::Br(Box::new(brotli::CompressorWriter::new(
                    Vec::new(),
                    4096,
                    quality,
                    22,
                )))
            }
            Encoding::Zstd => {
                let level = level.map_or(3, |l| l.clamp(-7, 22));
                Codec::Zstd(zstd::stream::write::Encoder::new(Vec::new(), level)?)
            }
        };
        Ok(Self { encoding, codec })
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Feeds uncompressed bytes.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.codec {
            Codec::Identity(out) => out.write_all(data),
            Codec::Deflate(w) => w.write_all(data),
            Codec::Gzip(w) => w.write_all(data),
            Codec::Br(w) => w.write_all(data),
            Codec::Zstd(w) => w.write_all(data),
        }
    }

    /// Sync-flushes the codec and returns everything it produced so far. The
    /// returned bytes decode to all input written up to this point.
    pub fn flush(&mut self) -> io::Result<Bytes> {
        let out = match &mut self.codec {
            Codec::Identity(out) => out,
            Codec::Deflate(w) => {
                w.flush()?;
                w.get_mut()
            }
            Codec::Gzip(w) => {
                w.flush()?;
                w.get_mut()
            }
            Codec::Br(w) => {
                w.flush()?;
                w.get_mut()
            }
            Codec::Zstd(w) => {
                w.flush()?;
                w.get_mut()
            }
        };
        Ok(Bytes::from(std::mem::take(out)))
    }

    /// Terminates the compressed stream and returns the remaining output.
    pub fn finish(self) -> io::Result<Bytes> {
        let out = match self.codec {
            Codec::Identity(out) => out,
            Codec::Deflate(w) => w.finish()?,
            Codec::Gzip(w) => w.finish()?,
            // `into_inner` writes the final brotli block.
            Codec::Br(w) => w.into_inner(),
            Codec::Zstd(w) => w.finish()?,
        };
        Ok(Bytes::from(out))
    }
}

fn flate_level(level: Option<i32>) -> Compression {
    level.map_or_else(Compression::default, |l| Compression::new(l.clamp(0, 9) as u32))
}

/// Compresses a whole buffer.
pub fn compress(encoding: Encoding, level: Option<i32>, data: &[u8]) -> io::Result<Bytes> {
    if encoding.is_identity() {
        return Ok(Bytes::copy_from_slice(data));
    }
    let mut compressor = Compressor::new(encoding, level)?;
    compressor.write(data)?;
    compressor.finish()
}
