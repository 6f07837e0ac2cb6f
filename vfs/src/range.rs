//! Byte ranges and their mapping onto a file's parts.

use common::{Error, Result};

/// Inclusive byte range `[start, end]` of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Fill in missing bounds (start 0, end total-1) and validate against `total`.
    pub fn resolve(start: Option<u64>, end: Option<u64>, total: u64) -> Result<Self> {
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(total.saturating_sub(1));
        let range = Self { start, end };
        range.check(total)?;
        Ok(range)
    }

    /// The whole of a non-empty file
    pub fn full(total: u64) -> Result<Self> {
        Self::resolve(None, None, total)
    }

    /// Parse a `Range` header value: `bytes=<start>-<end>`, either side optional.
    /// `bytes=-N` asks for the last N bytes.
    pub fn parse(header: &str, total: u64) -> Result<Self> {
        let invalid = || Error::InvalidOperation(format!("malformed range {:?}", header));
        let value = header.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        let (first, last) = value.split_once('-').ok_or_else(invalid)?;
        let number = |s: &str| -> Result<Option<u64>> {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<u64>().map(Some).map_err(|_| invalid())
            }
        };
        match (number(first)?, number(last)?) {
            (None, Some(suffix)) => {
                if suffix == 0 || total == 0 {
                    return Err(Error::InvalidRange { start: 0, end: 0, total });
                }
                Self::resolve(Some(total.saturating_sub(suffix)), None, total)
            }
            (start, end) => Self::resolve(start, end.map(|e| e.min(total.saturating_sub(1))), total),
        }
    }

    pub fn check(&self, total: u64) -> Result<()> {
        if self.start > self.end || self.end >= total {
            return Err(Error::InvalidRange {
                start: self.start,
                end: self.end,
                total,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Bytes `[start, end)` of the part at `part` in the part list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub part: usize,
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Map a file range onto per-part segments, in part order. Parts outside
/// the range produce no segment.
pub fn plan_segments(part_sizes: &[u64], range: ByteRange) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut offset = 0u64;
    for (part, &size) in part_sizes.iter().enumerate() {
        let part_start = offset;
        offset += size;
        if offset <= range.start {
            continue;
        }
        if part_start > range.end {
            break;
        }
        let start = range.start.saturating_sub(part_start);
        let end = (range.end + 1 - part_start).min(size);
        if end > start {
            segments.push(Segment { part, start, end });
        }
    }
    segments
}
