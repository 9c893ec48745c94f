//! The object storage seam.
//!
//! Jobs read datasets and write weights and images through [`ObjectStore`].
//! Provider failures are folded into [`StorageError`] so callers can decide
//! whether a retry makes sense without knowing which backend they talk to.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Access denied: {bucket}/{key}")]
    AccessDenied { bucket: String, key: String },

    #[error("Bucket does not exist: {0}")]
    NoSuchBucket(String),

    #[error("Storage provider error ({code}): {message}")]
    Provider { code: String, message: String },

    #[error("Local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Map a provider error code (or bare HTTP status) to a variant.
    pub fn from_provider(code: Option<&str>, message: String, bucket: &str, key: &str) -> Self {
        match code {
            Some("NoSuchKey" | "NotFound" | "404") => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            Some("AccessDenied" | "Forbidden" | "403") => StorageError::AccessDenied {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            Some("NoSuchBucket") => StorageError::NoSuchBucket(bucket.to_string()),
            other => StorageError::Provider {
                code: other.unwrap_or("Unknown").to_string(),
                message,
            },
        }
    }

    /// Missing objects, missing buckets and denied access do not heal on
    /// their own.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StorageError::NotFound { .. }
                | StorageError::AccessDenied { .. }
                | StorageError::NoSuchBucket(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Headers attached to an uploaded object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl PutOptions {
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a HEAD request.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub size: u64,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a whole object into memory.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: PutOptions,
    ) -> Result<(), StorageError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError>;

    /// A GET URL that works without credentials until `expires_in` passes.
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError>;

    /// Download an object to `path`, returning the number of bytes written.
    async fn download_to(&self, bucket: &str, key: &str, path: &Path) -> Result<u64, StorageError> {
        let body = self.get(bucket, key).await?;
        tokio::fs::write(path, &body).await?;
        Ok(body.len() as u64)
    }

    /// Upload the file at `path`.
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        options: PutOptions,
    ) -> Result<(), StorageError> {
        let body = tokio::fs::read(path).await?;
        self.put(bucket, key, body, options).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn provider_codes_are_classified() {
        let err = StorageError::from_provider(Some("NoSuchKey"), "gone".into(), "datasets", "a/b");
        assert_matches!(err, StorageError::NotFound { ref key, .. } if key == "a/b");
        assert!(!err.is_retryable());

        let err = StorageError::from_provider(Some("403"), String::new(), "weights", "k");
        assert_matches!(err, StorageError::AccessDenied { .. });

        let err = StorageError::from_provider(Some("NoSuchBucket"), String::new(), "nope", "k");
        assert_eq!(err.to_string(), "Bucket does not exist: nope");

        let err = StorageError::from_provider(Some("SlowDown"), "throttled".into(), "b", "k");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Storage provider error (SlowDown): throttled");

        let err = StorageError::from_provider(None, "reset".into(), "b", "k");
        assert_matches!(err, StorageError::Provider { ref code, .. } if code == "Unknown");
    }

    #[test]
    fn put_options_builder_collects_metadata() {
        let options = PutOptions::content_type("application/octet-stream")
            .with_metadata("studio_id", "s1")
            .with_metadata("upload_timestamp", "123");
        assert_eq!(options.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(options.metadata.len(), 2);
        assert_eq!(options.metadata["studio_id"], "s1");
    }
}
