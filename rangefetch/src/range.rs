//! Byte ranges of a remote resource.
//!
//! A [`ByteRange`] is a half-open interval `[start, start + length)`, or an
//! open-ended interval `[start, EOF)` when the length is unknown.
//!
//! On the wire a range is written the way HTTP `Range` headers and FTP resume
//! offsets expect it: `"<start>-"` for open ranges and `"<start>-<last>"` for
//! closed ones, where `last` is the inclusive final byte.

use std::fmt;
use std::str::FromStr;

/// A byte interval of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    start: u64,
    length: Option<u64>,
}

impl ByteRange {
    /// Creates a closed range `[start, start + length)`.
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            length: Some(length),
        }
    }

    /// Creates an open range `[start, EOF)`.
    pub fn from_offset(start: u64) -> Self {
        Self {
            start,
            length: None,
        }
    }

    /// The whole resource, `[0, EOF)`.
    pub fn whole() -> Self {
        Self::from_offset(0)
    }

    /// Creates a closed range from its exclusive end byte.
    ///
    /// Returns `None` if `end < start`.
    pub fn from_bounds(start: u64, end: u64) -> Option<Self> {
        end.checked_sub(start).map(|length| Self::new(start, length))
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Length of a closed range, `None` for an open one.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Exclusive end byte, `None` for an open range.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|len| self.start.saturating_add(len))
    }

    /// Returns true if the range runs to the end of the resource.
    pub fn goes_to_end(&self) -> bool {
        self.length.is_none()
    }

    /// A closed range must cover at least one byte and end at or before
    /// `u64::MAX` to be requested.
    pub fn is_valid(&self) -> bool {
        match self.length {
            Some(0) => false,
            Some(len) => self.start.checked_add(len).is_some(),
            None => true,
        }
    }

    /// Returns true for `[0, EOF)`, which needs no range on the wire.
    pub fn is_whole(&self) -> bool {
        self.start == 0 && self.length.is_none()
    }

    /// Returns true if `offset` falls inside the range.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && self.end().map_or(true, |end| offset < end)
    }

    /// Builds the wire range expression.
    ///
    /// Returns `None` for the whole resource (no range header is sent) and for
    /// invalid ranges.
    pub fn to_range_spec(&self) -> Option<String> {
        if self.is_whole() || !self.is_valid() {
            return None;
        }
        Some(match self.length {
            None => format!("{}-", self.start),
            Some(len) => format!("{}-{}", self.start, self.start + len - 1),
        })
    }

    /// Builds an HTTP `Range` header value (`bytes=...`).
    pub fn to_header_value(&self) -> Option<String> {
        self.to_range_spec().map(|spec| format!("bytes={}", spec))
    }
}

impl Default for ByteRange {
    fn default() -> Self {
        Self::whole()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, EOF)", self.start),
        }
    }
}

/// Error returned when a range expression cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed range expression: {0:?}")]
pub struct ParseRangeError(String);

impl FromStr for ByteRange {
    type Err = ParseRangeError;

    /// Parses `"a-b"`, `"a-"` or the same prefixed with `bytes=`.
    ///
    /// The end byte is inclusive, as on the wire.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRangeError(s.to_string());
        let spec = s.trim();
        let spec = spec.strip_prefix("bytes=").unwrap_or(spec);
        let (start, last) = spec.split_once('-').ok_or_else(err)?;

        let start: u64 = start.trim().parse().map_err(|_| err())?;
        let last = last.trim();
        if last.is_empty() {
            return Ok(Self::from_offset(start));
        }
        let last: u64 = last.parse().map_err(|_| err())?;
        if last < start {
            return Err(err());
        }
        Ok(Self::new(start, last - start + 1))
    }
}
