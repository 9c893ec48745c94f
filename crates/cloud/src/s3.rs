//! [`ObjectStore`] over the S3 API, pointed at Cloudflare R2.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::storage::{ObjectInfo, ObjectStore, PutOptions, StorageError};

/// R2 ignores regions but the signer needs one.
const R2_REGION: &str = "auto";

/// Connection settings for an R2 account.
#[derive(Debug, Clone)]
pub struct R2Config {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Any S3-compatible endpoint; replaces the account endpoint when set.
    pub endpoint_override: Option<String>,
}

impl R2Config {
    pub fn endpoint(&self) -> String {
        match &self.endpoint_override {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.r2.cloudflarestorage.com", self.account_id),
        }
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client for the configured R2 account.
    pub async fn connect(config: &R2Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "r2",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(R2_REGION))
            .endpoint_url(config.endpoint())
            .credentials_provider(credentials)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        tracing::info!(endpoint = %config.endpoint(), "Object storage client initialised");
        Self::new(Client::from_conf(s3_config))
    }
}

/// Fold an SDK failure into [`StorageError`], falling back to the HTTP
/// status when the response carried no error code (HEAD requests).
fn classify<E>(err: SdkError<E, HttpResponse>, bucket: &str, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err.raw_response().map(|response| response.status().as_u16());
    let code = err
        .code()
        .map(str::to_string)
        .or_else(|| status.map(|status| status.to_string()));
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    StorageError::from_provider(code.as_deref(), message, bucket, key)
}

fn stream_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::Provider {
        code: "ByteStream".to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        let body = response.body.collect().await.map_err(stream_error)?;
        Ok(body.into_bytes().to_vec())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: PutOptions,
    ) -> Result<(), StorageError> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_content_type(options.content_type)
            .set_metadata((!options.metadata.is_empty()).then_some(options.metadata))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        tracing::debug!(bucket, key, size, "Object uploaded");
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        Ok(ObjectInfo {
            size: response.content_length().unwrap_or(0).max(0) as u64,
            content_type: response.content_type().map(str::to_string),
            metadata: response.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(expires_in).map_err(|e| {
            StorageError::Provider {
                code: "PresigningConfig".to_string(),
                message: e.to_string(),
            }
        })?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(request.uri().to_string())
    }

    async fn download_to(&self, bucket: &str, key: &str, path: &Path) -> Result<u64, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        let mut reader = response.body.into_async_read();
        let mut file = tokio::fs::File::create(path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        Ok(written)
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        options: PutOptions,
    ) -> Result<(), StorageError> {
        let body = ByteStream::from_path(path).await.map_err(stream_error)?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .set_content_type(options.content_type)
            .set_metadata((!options.metadata.is_empty()).then_some(options.metadata))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        tracing::debug!(bucket, key, path = %path.display(), "File uploaded");
        Ok(())
    }
}
