//! Training on the hosted provider.
//!
//! [`HostedTrainingService::start`] packs the studio's cropped images into a
//! zip, hands a presigned link to the provider and returns the created
//! training. The provider later posts its completion back, and
//! [`HostedTrainingService::complete`] pulls the LoRA out of the output
//! archive into the weights bucket.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use studio_cloud::replicate::{callback_url, TrainingInput};
use studio_cloud::{ObjectStore, PutOptions, ReplicateClient, StorageError, TrainingTarget};
use studio_core::dataset::{caption_text, failure_summary, image_stem, FocusData};
use studio_core::jobs::{HostedTrainingRequest, ProviderCallback, DEFAULT_TRIGGER_WORD};
use studio_core::keys::{
    crop_data_key, dataset_archive_key, hosted_image_key, hosted_weights_key, DATASETS_BUCKET,
    LORA_WEIGHTS_FILE, WEIGHTS_BUCKET,
};
use studio_core::retry::RetryPolicy;
use studio_db::models::studio::StudioWeights;
use studio_db::records::JobRecords;
use studio_events::{AppNotification, WebhookDelivery};

use crate::dataset::{build_archive, prepare_hosted_image, HOSTED_MAX_IMAGES};
use crate::error::JobError;

/// Lifetime of the dataset link handed to the provider.
const DATASET_LINK_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct HostedSettings {
    pub target: TrainingTarget,
    /// Endpoint the provider posts completion to; no callback when unset.
    pub callback_base: Option<String>,
    /// Expected `secret` query value on provider callbacks.
    pub shared_secret: Option<String>,
    /// Application endpoint told about stored weights.
    pub app_webhook_url: Option<String>,
}

pub struct HostedTrainingService {
    pub store: Arc<dyn ObjectStore>,
    pub records: Arc<dyn JobRecords>,
    pub provider: ReplicateClient,
    pub webhooks: WebhookDelivery,
    pub settings: HostedSettings,
}

impl HostedTrainingService {
    /// Build and upload the dataset archive, then create the training.
    pub async fn start(&self, request: &HostedTrainingRequest) -> Result<Value, JobError> {
        let studio_id = request.studio_id.as_str();
        let store = &*self.store;
        tracing::info!(studio_id, object_key = %request.object_key, "Starting hosted training");

        let crop_key = crop_data_key(&request.object_key);
        let crop_data = RetryPolicy::STANDARD
            .run_if(
                "download crop data",
                || store.get(DATASETS_BUCKET, &crop_key),
                StorageError::is_retryable,
            )
            .await
            .map_err(|e| JobError::Invalid(format!("Failed to download crop data: {e}")))
            .and_then(|bytes| {
                FocusData::from_slice(&bytes)
                    .map_err(|e| JobError::Invalid(format!("Failed to download crop data: {e}")))
            })?;

        let caption = caption_text(DEFAULT_TRIGGER_WORD, &request.gender);
        let mut entries = Vec::new();
        let mut failed = Vec::new();
        let mut processed = 0usize;

        for entry in crop_data.iter() {
            if processed >= HOSTED_MAX_IMAGES {
                tracing::warn!(studio_id, limit = HOSTED_MAX_IMAGES, "Reached image limit");
                break;
            }

            let key = hosted_image_key(&request.object_key, &entry.filename);
            let bytes = match store.get(DATASETS_BUCKET, &key).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping image");
                    failed.push(entry.filename.clone());
                    continue;
                }
            };

            let crop = entry.crop.clone();
            let prepared = tokio::task::spawn_blocking(move || {
                prepare_hosted_image(&bytes, Some(&crop))
            })
            .await;
            match prepared {
                Ok(Ok(jpeg)) => {
                    processed += 1;
                    let stem = image_stem(processed);
                    entries.push((format!("{stem}.jpg"), jpeg));
                    entries.push((format!("{stem}.txt"), caption.clone().into_bytes()));
                }
                Ok(Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "Skipping undecodable image");
                    failed.push(entry.filename.clone());
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Image task failed");
                    failed.push(entry.filename.clone());
                }
            }
        }

        if !failed.is_empty() {
            tracing::warn!(studio_id, "Images skipped: {}", failure_summary(&failed));
        }
        if processed == 0 {
            return Err(JobError::Invalid("No images were successfully processed".to_string()));
        }

        let archive = tokio::task::spawn_blocking(move || build_archive(&entries))
            .await
            .map_err(|e| JobError::Archive(e.to_string()))??;

        let archive_key = dataset_archive_key(&request.object_key);
        RetryPolicy::STANDARD
            .run_if(
                "upload dataset archive",
                || {
                    let options = PutOptions::content_type("application/zip");
                    store.put(DATASETS_BUCKET, &archive_key, archive.clone(), options)
                },
                StorageError::is_retryable,
            )
            .await?;
        tracing::info!(
            studio_id,
            key = %archive_key,
            images = processed,
            size = archive.len(),
            "Dataset archive uploaded",
        );

        let dataset_url = store.presign_get(DATASETS_BUCKET, &archive_key, DATASET_LINK_TTL).await?;

        let webhook = match &self.settings.callback_base {
            Some(base) => Some(callback_url(
                base,
                &request.user_id,
                studio_id,
                self.settings.shared_secret.as_deref(),
            )?),
            None => {
                tracing::warn!(
                    studio_id,
                    "No callback URL configured; completion will not be processed",
                );
                None
            }
        };

        let input = TrainingInput::for_dataset(dataset_url);
        let training = self
            .provider
            .create_training(&self.settings.target, &input, webhook.as_deref())
            .await?;
        Ok(training)
    }

    /// Check the `secret` query value of a provider callback.
    pub fn verify_secret(&self, provided: Option<&str>) -> Result<(), JobError> {
        match self.settings.shared_secret.as_deref() {
            Some(expected) if provided != Some(expected) => {
                Err(JobError::Unauthorized("Invalid webhook secret".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Store the weights of a finished training and tell the application.
    pub async fn complete(
        &self,
        user_id: &str,
        studio_id: &str,
        callback: &ProviderCallback,
    ) -> Result<Value, JobError> {
        if !callback.succeeded() {
            tracing::info!(
                studio_id,
                provider_id = %callback.id,
                status = %callback.status,
                "Ignoring unsuccessful training",
            );
            return Ok(json!({
                "status": "ignored",
                "reason": format!("Training status: {}", callback.status),
            }));
        }

        let model_url = callback
            .trained_model_url()
            .ok_or_else(|| {
                JobError::Invalid("No trained model (.tar) found in output".to_string())
            })?;

        let archive = self.provider.download_output(model_url).await?;
        tracing::info!(studio_id, size = archive.len(), "Downloaded trained model archive");
        let weights = tokio::task::spawn_blocking(move || extract_lora(&archive))
            .await
            .map_err(|e| JobError::Archive(e.to_string()))??;

        let key = hosted_weights_key(user_id, studio_id);
        let store = &*self.store;
        RetryPolicy::STANDARD
            .run_if(
                "upload hosted weights",
                || {
                    let options = PutOptions::content_type("application/octet-stream");
                    store.put(WEIGHTS_BUCKET, &key, weights.clone(), options)
                },
                StorageError::is_retryable,
            )
            .await?;
        tracing::info!(studio_id, key = %key, size = weights.len(), "Hosted weights stored");

        let record = StudioWeights {
            weights: key.clone(),
            provider_id: callback.id.clone(),
        };
        match self.records.record_hosted_weights(studio_id, &record).await {
            Ok(true) => tracing::info!(studio_id, "Studio weights recorded"),
            Ok(false) => tracing::warn!(studio_id, "No studio row to attach weights to"),
            Err(e) => tracing::error!(studio_id, error = %e, "Failed to record studio weights"),
        }

        self.notify_app(studio_id).await;

        Ok(json!({
            "status": "success",
            "provider_id": callback.id,
            "message": "Training completion processed successfully",
            "weights": key,
        }))
    }

    async fn notify_app(&self, studio_id: &str) {
        let Some(url) = self.settings.app_webhook_url.as_deref() else {
            tracing::debug!(studio_id, "No application webhook configured");
            return;
        };
        match self.records.fetch_studio_snapshot(studio_id).await {
            Ok(Some(studio)) => {
                let outcome = self
                    .webhooks
                    .deliver(url, &AppNotification::training_completed(studio))
                    .await;
                let delivered = outcome.is_delivered();
                tracing::debug!(studio_id, delivered, "Application notified");
            }
            Ok(None) => tracing::warn!(studio_id, "Studio not found for application webhook"),
            Err(e) => tracing::error!(
                studio_id,
                error = %e,
                "Failed to load studio for application webhook",
            ),
        }
    }
}

/// Contents of the first archive entry whose path ends in `lora.safetensors`.
pub fn extract_lora(archive: &[u8]) -> Result<Vec<u8>, JobError> {
    let archive_error = |e: std::io::Error| JobError::Archive(e.to_string());
    let mut tar = tar::Archive::new(Cursor::new(archive));
    let mut names = Vec::new();

    for entry in tar.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        let name = entry.path().map_err(archive_error)?.to_string_lossy().into_owned();
        if name.ends_with(LORA_WEIGHTS_FILE) {
            let mut weights = Vec::new();
            entry.read_to_end(&mut weights).map_err(archive_error)?;
            return Ok(weights);
        }
        names.push(name);
    }

    tracing::error!(files = ?names, "No LoRA weights in trained model archive");
    Err(JobError::Archive(format!("{LORA_WEIGHTS_FILE} not found in tar file")))
}
