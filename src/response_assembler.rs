//! Response header construction for stream requests

use crate::error::{DeliveryError, Result};
use crate::models::{ByteRange, ObjectMetadata};
use http::header::{
    ACCEPT_RANGES, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, LAST_MODIFIED,
};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::time::SystemTime;
use tracing::debug;

/// Headers a browser player may read from a cross-origin response
pub const EXPOSED_HEADERS: &str =
    "Content-Range, Accept-Ranges, Content-Length, Content-Type, X-Cache, X-Response-Time";

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Last second an IMF-fixdate can express (9999-12-31T23:59:59Z)
const MAX_HTTP_DATE_SECS: i64 = 253_402_300_799;

/// Convert an RFC 3339 timestamp into an HTTP date
///
/// Returns `None` for unparsable values and for instants outside
/// 1970..=9999, which an IMF-fixdate cannot carry.
pub fn http_date(rfc3339: &str) -> Option<String> {
    let parsed = chrono::DateTime::parse_from_rfc3339(rfc3339).ok()?;
    if !(0..=MAX_HTTP_DATE_SECS).contains(&parsed.timestamp()) {
        return None;
    }
    Some(httpdate::fmt_http_date(SystemTime::from(parsed)))
}

/// Content type for a file name, judged by its extension
pub fn content_type_for_extension(path: &str) -> Option<&'static str> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file_name.rsplit_once('.')?;
    let content_type = match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "m4s" => "video/iso.segment",
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "vtt" => "text/vtt",
        "srt" => "application/x-subrip",
        "json" => "application/json",
        _ => return None,
    };
    Some(content_type)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| DeliveryError::InternalError(format!("Invalid header value: {}", e)))
}

/// Builds status lines and headers for `/stream` responses
#[derive(Debug, Clone)]
pub struct ResponseAssembler {
    cache_max_age_secs: u64,
}

impl ResponseAssembler {
    pub fn new(cache_max_age_secs: u64) -> Self {
        ResponseAssembler { cache_max_age_secs }
    }

    /// Content type for an object: extension first, then the store's record
    pub fn content_type(&self, metadata: &ObjectMetadata) -> String {
        content_type_for_extension(&metadata.name)
            .map(str::to_string)
            .or_else(|| metadata.content_type.clone().filter(|ct| !ct.is_empty()))
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
    }

    /// Build response headers for a servable request
    ///
    /// # Arguments
    /// * `metadata` - Object metadata
    /// * `client_range` - The clamped range, or `None` for the whole object
    ///
    /// # Returns
    /// 206 with Content-Range for a range, 200 otherwise
    pub fn build_response_header(
        &self,
        metadata: &ObjectMetadata,
        client_range: Option<ByteRange>,
    ) -> Result<(StatusCode, HeaderMap)> {
        let mut headers = HeaderMap::new();

        let status = match client_range {
            Some(range) => {
                if range.end >= metadata.size {
                    return Err(DeliveryError::InvalidRange(format!(
                        "Range end {} exceeds object size {}",
                        range.end, metadata.size
                    )));
                }
                headers.insert(CONTENT_LENGTH, HeaderValue::from(range.size()));
                headers.insert(
                    CONTENT_RANGE,
                    header_value(&range.to_content_range(metadata.size))?,
                );
                StatusCode::PARTIAL_CONTENT
            }
            None => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.size));
                StatusCode::OK
            }
        };

        headers.insert(CONTENT_TYPE, header_value(&self.content_type(metadata))?);
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(
            CACHE_CONTROL,
            header_value(&format!("public, max-age={}", self.cache_max_age_secs))?,
        );

        if let Some(etag) = &metadata.etag {
            let etag = if etag.starts_with('"') || etag.starts_with("W/") {
                etag.clone()
            } else {
                format!("\"{}\"", etag)
            };
            if let Ok(value) = HeaderValue::from_str(&etag) {
                headers.insert(ETAG, value);
            }
        }

        if let Some(updated) = &metadata.updated {
            match http_date(updated) {
                Some(date) => {
                    headers.insert(LAST_MODIFIED, header_value(&date)?);
                }
                None => debug!("Skipping Last-Modified, not an RFC 3339 time: {}", updated),
            }
        }

        self.apply_cors(&mut headers);

        debug!(
            "Built response headers: path={}, status={}, range={:?}",
            metadata.name, status, client_range
        );
        Ok((status, headers))
    }

    /// Headers for a 416 response: the satisfiable extent, no body
    pub fn build_unsatisfiable_header(&self, size: u64) -> Result<(StatusCode, HeaderMap)> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, header_value(&format!("bytes */{}", size))?);
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
        self.apply_cors(&mut headers);
        Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers))
    }

    /// Headers answering a CORS preflight
    pub fn build_preflight_header(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply_cors(&mut headers);
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, HEAD, OPTIONS"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Range, Content-Type"),
        );
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("3600"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
        headers
    }

    pub fn apply_cors(&self, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(
            ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSED_HEADERS),
        );
    }
}
