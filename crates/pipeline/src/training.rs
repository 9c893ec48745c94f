//! Local LoRA training job.
//!
//! Downloads the focus data and images for a studio, builds a captioned
//! dataset on disk, runs the trainer, uploads the resulting weights and marks
//! the studio completed. The outcome is reported to the request's webhook.
//!
//! The per-studio dataset and output directories are emptied when a job
//! starts and removed when it ends, whatever the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use studio_cloud::{ObjectStore, PutOptions, StorageError};
use studio_core::dataset::{caption_text, failure_summary, image_stem, FocusData};
use studio_core::jobs::TrainingRequest;
use studio_core::keys::{
    dataset_image_key, focus_data_key, studio_weights_key, DATASETS_BUCKET, WEIGHTS_BUCKET,
};
use studio_core::retry::RetryPolicy;
use studio_core::training_config::{config_path, TrainingConfig, TrainingConfigParams};
use studio_db::records::JobRecords;
use studio_events::{TrainingCallback, WebhookDelivery};

use crate::dataset::prepare_training_image;
use crate::error::JobError;
use crate::trainer::Trainer;

#[derive(Debug, Clone)]
pub struct TrainingSettings {
    /// Parent of the per-studio dataset and output directories.
    pub work_dir: PathBuf,
    pub model_cache_dir: PathBuf,
    /// Searches for trained weights before giving up.
    pub weights_search_attempts: u32,
    pub weights_search_interval: Duration,
}

impl TrainingSettings {
    pub fn new(work_dir: impl Into<PathBuf>, model_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            model_cache_dir: model_cache_dir.into(),
            weights_search_attempts: 3,
            weights_search_interval: Duration::from_secs(5),
        }
    }

    pub fn dataset_dir(&self, studio_id: &str) -> PathBuf {
        self.work_dir.join(format!("dataset_{studio_id}"))
    }

    pub fn output_dir(&self, studio_id: &str) -> PathBuf {
        self.work_dir.join(format!("output_{studio_id}"))
    }
}

pub struct TrainingJob {
    pub store: Arc<dyn ObjectStore>,
    pub records: Arc<dyn JobRecords>,
    pub trainer: Arc<dyn Trainer>,
    pub webhooks: WebhookDelivery,
    pub settings: TrainingSettings,
}

impl TrainingJob {
    /// Run the job to completion and report the outcome.
    pub async fn run(&self, request: TrainingRequest) -> TrainingCallback {
        let studio_id = request.studio_id.as_str();
        tracing::info!(
            studio_id,
            user_id = %request.user_id,
            steps = request.steps,
            "Training job started",
        );

        let result = self.train(&request).await;
        self.remove_work_dirs(studio_id).await;

        let callback = match result {
            Ok(weights_key) => {
                tracing::info!(studio_id, weights_key = %weights_key, "Training job completed");
                TrainingCallback::completed(studio_id, &request.user_id, &weights_key)
            }
            Err(e) => {
                tracing::error!(studio_id, error = %e, "Training job failed");
                TrainingCallback::failed(studio_id, &request.user_id, e.to_string())
            }
        };

        match request.webhook() {
            Some(url) => {
                let outcome = self.webhooks.deliver(url, &callback).await;
                let delivered = outcome.is_delivered();
                tracing::debug!(studio_id, delivered, "Training webhook sent");
            }
            None => tracing::debug!(studio_id, "No webhook configured for training job"),
        }
        callback
    }

    async fn train(&self, request: &TrainingRequest) -> Result<String, JobError> {
        let studio_id = request.studio_id.as_str();
        let settings = &self.settings;

        let cache_bytes = directory_size_bytes(settings.model_cache_dir.clone()).await;
        tracing::info!(
            cache_dir = %settings.model_cache_dir.display(),
            cached = cache_bytes > 0,
            size_gb = cache_bytes as f64 / 1e9,
            "Model cache status",
        );

        let dataset_dir = settings.dataset_dir(studio_id);
        let output_dir = settings.output_dir(studio_id);
        reset_dir(&dataset_dir).await?;
        reset_dir(&output_dir).await?;

        let focus = self.download_focus_data(&request.object_key).await?;
        let processed = self.build_dataset(request, &focus, &dataset_dir).await?;
        tracing::info!(studio_id, processed, total = focus.len(), "Dataset prepared");

        let config_file = config_path(&settings.work_dir, studio_id);
        let config = TrainingConfig::build(&TrainingConfigParams {
            user_id: &request.user_id,
            studio_id,
            trigger_word: &request.trigger_word,
            steps: request.steps,
            dataset_dir: &dataset_dir,
            output_dir: &output_dir,
            model_cache_dir: &settings.model_cache_dir,
        });
        let yaml = config.to_yaml().map_err(|e| JobError::Config(e.to_string()))?;
        tokio::fs::write(&config_file, yaml)
            .await
            .map_err(|e| JobError::Config(e.to_string()))?;

        let output = self.trainer.train(&config_file).await?;
        tracing::info!(studio_id, duration_ms = output.duration_ms, "Trainer exited cleanly");

        let weights_path = find_weights(
            &output_dir,
            settings.weights_search_attempts,
            settings.weights_search_interval,
        )
        .await?;

        let weights_key = studio_weights_key(studio_id);
        self.upload_weights(studio_id, &weights_path, &weights_key).await?;

        let records = &*self.records;
        match RetryPolicy::STANDARD
            .run_if(
                "mark studio completed",
                || records.mark_studio_completed(studio_id),
                |e| e.is_retryable(),
            )
            .await
        {
            Ok(true) => tracing::info!(studio_id, "Studio marked completed"),
            Ok(false) => tracing::warn!(studio_id, "No studio row to mark completed"),
            Err(e) => tracing::error!(studio_id, error = %e, "Failed to update studio status"),
        }

        Ok(weights_key)
    }

    async fn remove_work_dirs(&self, studio_id: &str) {
        for dir in [
            self.settings.dataset_dir(studio_id),
            self.settings.output_dir(studio_id),
        ] {
            if let Err(e) = remove_dir_if_exists(&dir).await {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove work directory");
            }
        }
    }

    async fn download_focus_data(&self, object_key: &str) -> Result<FocusData, JobError> {
        let key = focus_data_key(object_key);
        let store = &*self.store;

        let bytes = RetryPolicy::FOCUS_DATA
            .run_if(
                "download focus data",
                || store.get(DATASETS_BUCKET, &key),
                StorageError::is_retryable,
            )
            .await
            .map_err(|e| match e {
                StorageError::NotFound { .. } => {
                    JobError::FocusData(format!("focus_data.json not found at {key}"))
                }
                StorageError::AccessDenied { .. } => {
                    JobError::FocusData("Access denied to focus_data.json".to_string())
                }
                other => JobError::Storage(other),
            })?;

        FocusData::from_slice(&bytes)
            .map_err(|e| JobError::FocusData(format!("Invalid JSON in focus_data.json: {e}")))
    }

    /// Write `image_NNN.<ext>` and `image_NNN.txt` for every usable entry.
    async fn build_dataset(
        &self,
        request: &TrainingRequest,
        focus: &FocusData,
        dataset_dir: &Path,
    ) -> Result<usize, JobError> {
        let caption = caption_text(&request.trigger_word, &request.gender);
        let store = &*self.store;
        let mut failed = Vec::new();
        let mut processed = 0usize;

        for entry in focus.iter() {
            let key = dataset_image_key(&request.object_key, &entry.filename);
            let bytes = match RetryPolicy::STANDARD
                .run_if(
                    "download dataset image",
                    || store.get(DATASETS_BUCKET, &key),
                    StorageError::is_retryable,
                )
                .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping dataset image");
                    failed.push(entry.filename.clone());
                    continue;
                }
            };

            let crop = entry.crop.clone();
            let prepared =
                tokio::task::spawn_blocking(move || prepare_training_image(&bytes, &crop)).await;
            let image = match prepared {
                Ok(Ok(image)) => image,
                Ok(Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "Skipping undecodable image");
                    failed.push(entry.filename.clone());
                    continue;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Image task failed");
                    failed.push(entry.filename.clone());
                    continue;
                }
            };

            processed += 1;
            let stem = image_stem(processed);
            let image_path = dataset_dir.join(format!("{stem}.{}", image.extension));
            tokio::fs::write(image_path, &image.bytes).await?;
            tokio::fs::write(dataset_dir.join(format!("{stem}.txt")), &caption).await?;
        }

        if !failed.is_empty() {
            tracing::warn!(
                studio_id = %request.studio_id,
                "Dataset images skipped: {}",
                failure_summary(&failed)
            );
        }
        if processed == 0 {
            return Err(JobError::Dataset(format!(
                "No images were successfully processed ({})",
                failure_summary(&failed)
            )));
        }
        Ok(processed)
    }

    async fn upload_weights(
        &self,
        studio_id: &str,
        path: &Path,
        key: &str,
    ) -> Result<(), JobError> {
        let local_size = tokio::fs::metadata(path).await?.len();
        if local_size == 0 {
            return Err(JobError::UploadVerification(format!(
                "local weights file is empty: {}",
                path.display()
            )));
        }

        let options = PutOptions::content_type("application/octet-stream")
            .with_metadata("studio_id", studio_id)
            .with_metadata("upload_timestamp", chrono::Utc::now().timestamp().to_string());
        let store = &*self.store;

        RetryPolicy::WEIGHTS_UPLOAD
            .run_if(
                "upload weights",
                || put_and_verify(store, key, path, options.clone()),
                JobError::is_retryable,
            )
            .await
            .map(|size| {
                tracing::info!(studio_id, key, size, "Weights uploaded and verified");
            })
    }
}

/// Upload `path` to the weights bucket and confirm it landed non-empty.
async fn put_and_verify(
    store: &dyn ObjectStore,
    key: &str,
    path: &Path,
    options: PutOptions,
) -> Result<u64, JobError> {
    store.put_file(WEIGHTS_BUCKET, key, path, options).await?;
    match store.head(WEIGHTS_BUCKET, key).await {
        Ok(info) if info.size == 0 => Err(JobError::UploadVerification(
            "uploaded file is empty".to_string(),
        )),
        Ok(info) => Ok(info.size),
        Err(e) if e.is_not_found() => Err(JobError::UploadVerification(
            "uploaded file not found".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Recreate `dir` empty.
async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    remove_dir_if_exists(dir).await?;
    tokio::fs::create_dir_all(dir).await
}

/// Total size of regular files under `dir`; zero when it does not exist.
pub async fn directory_size_bytes(dir: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || {
        list_files(&dir)
            .iter()
            .filter_map(|path| std::fs::metadata(path).ok())
            .map(|meta| meta.len())
            .sum()
    })
    .await
    .unwrap_or(0)
}

/// First non-empty `.safetensors` under `dir`, searched up to `attempts` times.
pub async fn find_weights(
    dir: &Path,
    attempts: u32,
    interval: Duration,
) -> Result<PathBuf, JobError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let root = dir.to_path_buf();
        let found = tokio::task::spawn_blocking(move || {
            list_files(&root).into_iter().find(|path| {
                path.extension().is_some_and(|ext| ext == "safetensors")
                    && std::fs::metadata(path).is_ok_and(|meta| meta.len() > 0)
            })
        })
        .await
        .ok()
        .flatten();

        if let Some(path) = found {
            tracing::info!(path = %path.display(), attempt, "Found trained weights");
            return Ok(path);
        }
        if attempt < attempts {
            tracing::warn!(dir = %dir.display(), attempt, "Trained weights not found yet");
            tokio::time::sleep(interval).await;
        }
    }

    let root = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || list_files(&root))
        .await
        .unwrap_or_default();
    tracing::error!(
        dir = %dir.display(),
        files = ?files,
        "No trained weights in output directory",
    );
    Err(JobError::WeightsNotFound(
        "No trained weights (.safetensors) found in output directory".to_string(),
    ))
}

/// Every regular file under `dir`, sorted.
fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => pending.push(entry.path()),
                Ok(kind) if kind.is_file() => files.push(entry.path()),
                _ => {}
            }
        }
    }
    files.sort();
    files
}
