//! Errors raised inside background jobs.
//!
//! The `Display` text of a [`JobError`] is what ends up in the `error` field
//! of a failure webhook, so messages are written for the receiving
//! application rather than for operators.

use studio_cloud::{ReplicateError, StorageError};
use studio_comfyui::{RunError, WorkflowError};
use studio_db::records::DbError;

use crate::trainer::TrainerError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Records(#[from] DbError),

    /// Focus or crop data missing, denied or malformed.
    #[error("{0}")]
    FocusData(String),

    /// No usable images came out of the dataset.
    #[error("{0}")]
    Dataset(String),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to write training config: {0}")]
    Config(String),

    #[error(transparent)]
    Trainer(#[from] TrainerError),

    #[error("{0}")]
    WeightsNotFound(String),

    #[error("Weights upload verification failed: {0}")]
    UploadVerification(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Render(#[from] RunError),

    /// The render finished without the expected outputs.
    #[error("{0}")]
    Generation(String),

    #[error(transparent)]
    Provider(#[from] ReplicateError),

    #[error("Archive error: {0}")]
    Archive(String),

    /// The request itself is unusable; maps to HTTP 400.
    #[error("{0}")]
    Invalid(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Whether repeating the failed step could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Storage(e) => e.is_retryable(),
            JobError::Records(e) => e.is_retryable(),
            JobError::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            JobError::Provider(ReplicateError::Request(_)) => true,
            _ => false,
        }
    }
}

impl From<zip::result::ZipError> for JobError {
    fn from(err: zip::result::ZipError) -> Self {
        JobError::Archive(err.to_string())
    }
}
