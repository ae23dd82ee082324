//! Core data models for the delivery cache layer

use crate::error::{DeliveryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Represents a byte range for HTTP Range requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Arguments
    /// * `start` - Starting byte position (inclusive)
    /// * `end` - Ending byte position (inclusive)
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if the range is valid
    /// * `Err(DeliveryError)` if start > end
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(DeliveryError::InvalidRange(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Get the size of this byte range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Convert this ByteRange to an HTTP Range header value
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Content-Range header value for an object of `total` bytes
    pub fn to_content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Metadata about an object as reported by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object path inside the bucket
    pub name: String,
    /// Total size of the object in bytes
    pub size: u64,
    /// Content type recorded by the store
    pub content_type: Option<String>,
    /// ETag for cache validation
    pub etag: Option<String>,
    /// Creation time, RFC 3339
    pub created: Option<String>,
    /// Last update time, RFC 3339
    pub updated: Option<String>,
}

impl ObjectMetadata {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        ObjectMetadata {
            name: name.into(),
            size,
            content_type: None,
            etag: None,
            created: None,
            updated: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// A metadata value plus the instant it was fetched from the store
#[derive(Debug, Clone)]
pub struct ObjectMetadataEntry {
    pub metadata: std::sync::Arc<ObjectMetadata>,
    pub fetched_at: Instant,
}

/// Whether a payload came out of the content cache or from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}
