//! Range header analysis for stream requests

use crate::config::StreamingConfig;
use crate::error::{DeliveryError, Result};
use crate::models::ByteRange;
use http::header::RANGE;
use http::{HeaderMap, HeaderValue};
use tracing::debug;

/// A single range as written by the client, before it is checked
/// against the object size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=<start>-` or `bytes=<start>-<end>`
    FromTo { start: u64, end: Option<u64> },
    /// `bytes=-<n>`: the last `n` bytes
    Suffix(u64),
}

/// What a request asks for once checked against the object size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No Range header: the whole object
    Full,
    /// A satisfiable range, already clamped to the object
    Partial(ByteRange),
    /// A range that cannot be served (416)
    Unsatisfiable,
}

/// Parses Range headers and resolves them against object sizes
#[derive(Debug, Clone)]
pub struct RequestAnalyzer {
    max_open_range_bytes: Option<u64>,
}

impl RequestAnalyzer {
    pub fn new(config: &StreamingConfig) -> Self {
        RequestAnalyzer {
            max_open_range_bytes: config.max_open_range_bytes,
        }
    }

    /// Analyzer that serves open-ended ranges to the end of the object
    pub fn uncapped() -> Self {
        RequestAnalyzer {
            max_open_range_bytes: None,
        }
    }

    /// Decide what to serve for a request against an object of `size` bytes
    ///
    /// # Logic
    /// - no Range header → `Full`
    /// - malformed header, multiple ranges, `start >= size`, `start > end`
    ///   or an empty suffix → `Unsatisfiable`
    /// - otherwise `Partial` with `end` clamped to `size - 1`; open-ended
    ///   ranges are additionally capped to `max_open_range_bytes`
    pub fn resolve(&self, headers: &HeaderMap<HeaderValue>, size: u64) -> RangeOutcome {
        let Some(value) = headers.get(RANGE) else {
            return RangeOutcome::Full;
        };

        let parsed = value
            .to_str()
            .map_err(|e| DeliveryError::InvalidRange(format!("non-ASCII Range header: {}", e)))
            .and_then(Self::parse_range_header);

        let spec = match parsed {
            Ok(spec) => spec,
            Err(e) => {
                debug!("Rejecting Range header {:?}: {}", value, e);
                return RangeOutcome::Unsatisfiable;
            }
        };

        self.clamp(spec, size)
    }

    /// Parse a Range header value into a [`RangeSpec`]
    ///
    /// # Arguments
    /// * `header` - The Range header value (e.g., "bytes=0-1023")
    pub fn parse_range_header(header: &str) -> Result<RangeSpec> {
        let header = header.trim();
        let ranges = header.strip_prefix("bytes=").ok_or_else(|| {
            DeliveryError::InvalidRange(format!(
                "Range header must start with 'bytes=', got: {}",
                header
            ))
        })?;

        if ranges.contains(',') {
            return Err(DeliveryError::InvalidRange(
                "multiple ranges are not supported".to_string(),
            ));
        }

        let (start, end) = ranges.split_once('-').ok_or_else(|| {
            DeliveryError::InvalidRange(format!("expected 'start-end', got: {}", ranges))
        })?;
        let (start, end) = (start.trim(), end.trim());

        let parse = |value: &str| {
            value.parse::<u64>().map_err(|e| {
                DeliveryError::InvalidRange(format!("invalid position '{}': {}", value, e))
            })
        };

        match (start.is_empty(), end.is_empty()) {
            (true, true) => Err(DeliveryError::InvalidRange("empty range".to_string())),
            (true, false) => Ok(RangeSpec::Suffix(parse(end)?)),
            (false, true) => Ok(RangeSpec::FromTo {
                start: parse(start)?,
                end: None,
            }),
            (false, false) => Ok(RangeSpec::FromTo {
                start: parse(start)?,
                end: Some(parse(end)?),
            }),
        }
    }

    /// Check a parsed range against the object size
    pub fn clamp(&self, spec: RangeSpec, size: u64) -> RangeOutcome {
        if size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let last = size - 1;

        let (start, end) = match spec {
            RangeSpec::FromTo { start, .. } if start >= size => return RangeOutcome::Unsatisfiable,
            RangeSpec::FromTo {
                start,
                end: Some(end),
            } => {
                if start > end {
                    return RangeOutcome::Unsatisfiable;
                }
                (start, end.min(last))
            }
            RangeSpec::FromTo { start, end: None } => {
                let end = match self.max_open_range_bytes {
                    Some(cap) => start.saturating_add(cap.max(1) - 1).min(last),
                    None => last,
                };
                (start, end)
            }
            RangeSpec::Suffix(0) => return RangeOutcome::Unsatisfiable,
            RangeSpec::Suffix(n) => (size.saturating_sub(n), last),
        };

        match ByteRange::new(start, end) {
            Ok(range) => RangeOutcome::Partial(range),
            Err(_) => RangeOutcome::Unsatisfiable,
        }
    }
}
