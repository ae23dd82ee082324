//! Google Cloud Storage backend over the JSON API

use super::{BackendConnector, ObjectBackend};
use crate::config::StoreConfig;
use crate::error::{DeliveryError, Result};
use crate::models::{ByteRange, ObjectMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    time_created: Option<String>,
    #[serde(default)]
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsListing {
    #[serde(default)]
    items: Vec<GcsObject>,
}

impl GcsObject {
    fn into_metadata(self) -> Result<ObjectMetadata> {
        let size = match self.size.as_deref() {
            Some(size) => size.parse::<u64>().map_err(|e| {
                DeliveryError::StoreUnavailable(format!("invalid object size '{}': {}", size, e))
            })?,
            None => 0,
        };

        Ok(ObjectMetadata {
            name: self.name,
            size,
            content_type: self.content_type,
            etag: self.etag,
            created: self.time_created,
            updated: self.updated,
        })
    }
}

fn transport_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout(format!("store request timed out: {}", e))
    } else {
        DeliveryError::StoreUnavailable(format!("store request failed: {}", e))
    }
}

/// One authenticated connection to a bucket
pub struct GcsBackend {
    client: Client,
    endpoint: Url,
    bucket: String,
    token: Option<String>,
}

impl GcsBackend {
    /// URL of the bucket's object collection, or of one object in it
    fn objects_url(&self, object: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                DeliveryError::ConfigError(format!(
                    "store endpoint {} cannot be a base",
                    self.endpoint
                ))
            })?;
            segments
                .pop_if_empty()
                .extend(["storage", "v1", "b", self.bucket.as_str(), "o"]);
            if let Some(object) = object {
                // The whole object name is one segment: '/' is percent-encoded.
                segments.push(object);
            }
        }
        Ok(url)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectBackend for GcsBackend {
    async fn head(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        let url = self.objects_url(Some(path))?;
        let response = self.get(url).send().await.map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("Store reports object absent: path={}", path);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DeliveryError::from_store_status(status.as_u16(), "metadata request"));
        }

        let body = response.bytes().await.map_err(transport_error)?;
        let object: GcsObject = serde_json::from_slice(&body)?;
        object.into_metadata().map(Some)
    }

    async fn read_range(&self, path: &str, range: ByteRange) -> Result<Bytes> {
        let mut url = self.objects_url(Some(path))?;
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self
            .get(url)
            .header("Range", range.to_header())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::from_store_status(status.as_u16(), "media request"));
        }

        let body = response.bytes().await.map_err(transport_error)?;
        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(body);
        }

        // Range ignored by the store: cut the requested window out of the full body.
        let len = body.len() as u64;
        if range.start >= len {
            return Err(DeliveryError::InvalidRange(format!(
                "start {} beyond object size {}",
                range.start, len
            )));
        }
        let end = range.end.min(len - 1);
        Ok(body.slice(range.start as usize..=end as usize))
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectMetadata>> {
        let mut url = self.objects_url(None)?;
        url.query_pairs_mut()
            .append_pair("prefix", prefix)
            .append_pair("maxResults", &limit.to_string());

        let response = self.get(url).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::from_store_status(status.as_u16(), "list request"));
        }

        let body = response.bytes().await.map_err(transport_error)?;
        let listing: GcsListing = serde_json::from_slice(&body)?;
        listing
            .items
            .into_iter()
            .take(limit)
            .map(GcsObject::into_metadata)
            .collect()
    }
}

/// Builds [`GcsBackend`] connections from a [`StoreConfig`]
pub struct GcsConnector {
    config: StoreConfig,
}

impl GcsConnector {
    pub fn new(config: StoreConfig) -> Self {
        GcsConnector { config }
    }

    /// Load the bearer token: credentials file first, then the environment
    async fn load_token(&self) -> Result<Option<String>> {
        if let Some(path) = &self.config.credentials_path {
            let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                DeliveryError::StoreUnavailable(format!(
                    "cannot read credentials file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let token = token.trim().to_string();
            if token.is_empty() {
                return Err(DeliveryError::StoreUnavailable(format!(
                    "credentials file {} is empty",
                    path.display()
                )));
            }
            return Ok(Some(token));
        }

        Ok(std::env::var(&self.config.access_token_env)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()))
    }
}

#[async_trait]
impl BackendConnector for GcsConnector {
    async fn connect(&self) -> Result<Arc<dyn ObjectBackend>> {
        let endpoint = Url::parse(&self.config.endpoint).map_err(|e| {
            DeliveryError::ConfigError(format!(
                "invalid store endpoint '{}': {}",
                self.config.endpoint, e
            ))
        })?;
        let token = self.load_token().await?;
        if token.is_none() {
            debug!("No store credentials configured, using anonymous access");
        }

        let client = Client::builder()
            .timeout(self.config.request_timeout())
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| DeliveryError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Arc::new(GcsBackend {
            client,
            endpoint,
            bucket: self.config.bucket.clone(),
            token,
        }))
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.public_base_url.trim_end_matches('/'),
            self.config.bucket,
            path
        )
    }

    fn uses_service_account(&self) -> bool {
        self.config.credentials_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(endpoint: &str) -> GcsBackend {
        GcsBackend {
            client: Client::new(),
            endpoint: Url::parse(endpoint).unwrap(),
            bucket: "media".to_string(),
            token: None,
        }
    }

    #[test]
    fn test_object_url_encodes_slashes() {
        let url = backend("https://storage.googleapis.com")
            .objects_url(Some("videos/a b.mp4"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/media/o/videos%2Fa%20b.mp4"
        );
    }

    #[test]
    fn test_public_url() {
        let connector = GcsConnector::new(StoreConfig {
            bucket: "media".to_string(),
            ..StoreConfig::default()
        });
        assert_eq!(
            connector.public_url("videos/a.mp4"),
            "https://storage.googleapis.com/media/videos/a.mp4"
        );
        assert!(!connector.uses_service_account());
    }

    #[test]
    fn test_metadata_size_parsing() {
        let object: GcsObject = serde_json::from_str(
            r#"{"name":"a.mp4","size":"1000","contentType":"video/mp4","etag":"CAE="}"#,
        )
        .unwrap();
        let meta = object.into_metadata().unwrap();
        assert_eq!(meta.size, 1000);
        assert_eq!(meta.content_type.as_deref(), Some("video/mp4"));
    }
}
