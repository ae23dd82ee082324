//! Remote object store access
//!
//! The store is reached through two traits:
//!
//! - [`BackendConnector`] establishes a connection (credentials, HTTP client)
//!   and hands out a fresh [`ObjectBackend`] each time it is asked.
//! - [`ObjectBackend`] performs the actual object operations over one
//!   established connection.
//!
//! [`StoreClient`] sits on top and owns the connection lifecycle: it connects
//! lazily, drops the connection when the store reports expired credentials,
//! reconnects and retries the failed operation exactly once.

pub mod client;
pub mod gcs;
pub mod memory;

use crate::error::Result;
use crate::models::{ByteRange, ObjectMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub use client::{ReconnectListener, StoreClient, StoreStatus};
pub use gcs::{GcsBackend, GcsConnector};
pub use memory::{MemoryBackend, MemoryConnector};

/// Object operations over one established store connection
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Fetch metadata for one object
    ///
    /// # Returns
    /// * `Ok(Some(metadata))` if the object exists
    /// * `Ok(None)` if it does not
    async fn head(&self, path: &str) -> Result<Option<ObjectMetadata>>;

    /// Read an inclusive byte range of one object
    async fn read_range(&self, path: &str, range: ByteRange) -> Result<Bytes>;

    /// List objects whose path starts with `prefix`, at most `limit` of them
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectMetadata>>;
}

/// Establishes store connections
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Build a new connection, reloading credentials
    async fn connect(&self) -> Result<Arc<dyn ObjectBackend>>;

    /// Bucket the connector points at
    fn bucket(&self) -> &str;

    /// Endpoint the connector talks to
    fn endpoint(&self) -> &str;

    /// Publicly reachable URL of an object
    fn public_url(&self, path: &str) -> String;

    /// Whether connections authenticate with a service-account credential
    fn uses_service_account(&self) -> bool;
}
