//! Error types for the media delivery cache layer

use thiserror::Error;

/// Result type alias for delivery operations
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types that can occur while serving media out of the object store
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    #[error("Store credentials expired: {0}")]
    AuthExpired(String),

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Corrupt cache entry: {0}")]
    CorruptCacheEntry(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        DeliveryError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::InternalError(format!("JSON error: {}", err))
    }
}

impl From<http::Error> for DeliveryError {
    fn from(err: http::Error) -> Self {
        DeliveryError::HttpError(err.to_string())
    }
}

impl DeliveryError {
    /// Convert error to HTTP status code
    ///
    /// Only absence and unsatisfiable ranges are the client's business;
    /// every other failure is reported as 500.
    pub fn to_http_status(&self) -> u16 {
        match self {
            DeliveryError::NotFound(_) => 404,
            DeliveryError::InvalidRange(_) => 416,

            DeliveryError::AuthExpired(_) => 500,
            DeliveryError::StoreUnavailable(_) => 500,
            DeliveryError::Timeout(_) => 500,
            DeliveryError::CorruptCacheEntry(_) => 500,
            DeliveryError::CacheError(_) => 500,
            DeliveryError::ConfigError(_) => 500,
            DeliveryError::IoError(_) => 500,
            DeliveryError::HttpError(_) => 500,
            DeliveryError::InternalError(_) => 500,
        }
    }

    /// Short message that is safe to put in a response body.
    ///
    /// Never includes object paths, store URLs or credential details.
    pub fn client_message(&self) -> &'static str {
        match self {
            DeliveryError::NotFound(_) => "Object not found",
            DeliveryError::InvalidRange(_) => "Requested range not satisfiable",
            _ => "Internal server error",
        }
    }

    /// Whether the store rejected our credentials and a reconnect may help
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, DeliveryError::AuthExpired(_))
    }

    /// Create a store error from an HTTP status returned by the store
    ///
    /// 401 becomes `AuthExpired`, 404 `NotFound`, 416 `InvalidRange`;
    /// anything else means the store could not serve the call.
    pub fn from_store_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => DeliveryError::AuthExpired(message),
            404 => DeliveryError::NotFound(message),
            416 => DeliveryError::InvalidRange(message),
            _ => DeliveryError::StoreUnavailable(format!("HTTP {}: {}", status, message)),
        }
    }
}
