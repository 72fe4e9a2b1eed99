//! Single byte-range parsing and slicing.
//!
//! Only `bytes=start-end` and `bytes=start-` are accepted. The slice is cut
//! from a body that has already been downloaded in full.

use std::str::FromStr;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use isokit_net::Response;
use thiserror::Error;

/// Errors from range handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// The header is not a single `bytes=` range this layer understands.
    #[error("Malformed range header: {0}")]
    Malformed(String),

    /// The range does not overlap the representation.
    #[error("Range starting at {start} not satisfiable for {length} bytes")]
    Unsatisfiable {
        start: u64,
        end: Option<u64>,
        length: u64,
    },

    /// A framing header could not be built from the computed value.
    #[error("Invalid {name} header value: {value:?}")]
    InvalidHeader { name: &'static str, value: String },
}

/// A parsed `Range` header. `end` is inclusive; `None` means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

/// A range checked against a concrete length: `start <= end < length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn parse(header: &str) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(header.to_string());

        let header = header.trim();
        let spec = header
            .get(..6)
            .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
            .map(|_| &header[6..])
            .ok_or_else(malformed)?;

        if spec.contains(',') {
            return Err(malformed());
        }

        let (start, end) = spec.split_once('-').ok_or_else(malformed)?;
        let start = parse_position(start).ok_or_else(malformed)?;
        let end = match end.trim() {
            "" => None,
            end => Some(parse_position(end).ok_or_else(malformed)?),
        };

        Ok(Self { start, end })
    }

    /// Check this range against a body of `length` bytes.
    ///
    /// An `end` past the last byte is clamped to it.
    pub fn resolve(&self, length: u64) -> Result<ResolvedRange, RangeError> {
        let unsatisfiable = RangeError::Unsatisfiable {
            start: self.start,
            end: self.end,
            length,
        };

        if length == 0 || self.start >= length {
            return Err(unsatisfiable);
        }

        let last = length - 1;
        let end = self.end.map_or(last, |end| end.min(last));
        if end < self.start {
            return Err(unsatisfiable);
        }

        Ok(ResolvedRange {
            start: self.start,
            end,
            length,
        })
    }
}

impl FromStr for ByteRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Plain decimal digits only; `u64::from_str` would also take a leading `+`.
fn parse_position(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl ResolvedRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `bytes {start}-{end}/{length}`
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.length)
    }
}

/// Cut `range` out of `body` and frame it as `206 Partial Content`.
///
/// `Content-Type` is carried over from the full response when present.
pub fn slice(
    body: &Bytes,
    range: ByteRange,
    content_type: Option<&HeaderValue>,
) -> Result<Response, RangeError> {
    let resolved = range.resolve(body.len() as u64)?;
    let part = body.slice(resolved.start as usize..=resolved.end as usize);

    let mut response = Response::new(StatusCode::PARTIAL_CONTENT, part)
        .with_status_text("Partial Content")
        .with_header(CONTENT_RANGE, content_range_value(&resolved.content_range())?)
        .with_header(CONTENT_LENGTH, HeaderValue::from(resolved.len()));
    if let Some(content_type) = content_type {
        response = response.with_header(CONTENT_TYPE, content_type.clone());
    }
    Ok(response)
}

/// `416 Range Not Satisfiable` with `Content-Range: bytes */{length}`.
pub fn not_satisfiable(length: u64) -> Result<Response, RangeError> {
    let content_range = content_range_value(&format!("bytes */{length}"))?;
    Ok(Response::new(StatusCode::RANGE_NOT_SATISFIABLE, Bytes::new())
        .with_header(CONTENT_RANGE, content_range))
}

fn content_range_value(s: &str) -> Result<HeaderValue, RangeError> {
    HeaderValue::from_str(s).map_err(|_| RangeError::InvalidHeader {
        name: "content-range",
        value: s.to_string(),
    })
}
