//! Webhook bodies sent when jobs finish.

use serde::{Deserialize, Serialize};

/// Event name of the application notification sent after hosted training.
pub const TRAINING_COMPLETED_EVENT: &str = "training_completed";

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    Completed,
    Failed,
}

/// Result of a local training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCallback {
    /// Same as `studio_id`.
    pub id: String,
    pub studio_id: String,
    pub status: TrainingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights_url: Option<String>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrainingCallback {
    pub fn completed(studio_id: &str, user_id: &str, weights_key: &str) -> Self {
        Self {
            id: studio_id.to_string(),
            studio_id: studio_id.to_string(),
            status: TrainingStatus::Completed,
            weights_url: Some(weights_key.to_string()),
            user_id: user_id.to_string(),
            error: None,
        }
    }

    pub fn failed(studio_id: &str, user_id: &str, error: impl Into<String>) -> Self {
        Self {
            id: studio_id.to_string(),
            studio_id: studio_id.to_string(),
            status: TrainingStatus::Failed,
            weights_url: None,
            user_id: user_id.to_string(),
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Result of a headshot generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerationCallback {
    Success(GenerationSuccess),
    Failure(GenerationFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSuccess {
    pub request_id: String,
    pub success: bool,
    pub headshot_id: String,
    pub preview_url: String,
    pub result_url: String,
    /// Serialized as `null` when the workflow produced no HD image.
    pub hd_url: Option<String>,
    pub prompt: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationFailure {
    pub request_id: String,
    pub success: bool,
    pub error: String,
    pub timestamp: i64,
}

/// Public URLs of the uploaded renditions.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedUrls {
    pub preview_url: String,
    pub result_url: String,
    pub hd_url: Option<String>,
}

impl GenerationCallback {
    pub fn success(
        request_id: &str,
        headshot_id: String,
        urls: GeneratedUrls,
        prompt: &str,
    ) -> Self {
        GenerationCallback::Success(GenerationSuccess {
            request_id: request_id.to_string(),
            success: true,
            headshot_id,
            preview_url: urls.preview_url,
            result_url: urls.result_url,
            hd_url: urls.hd_url,
            prompt: prompt.to_string(),
            timestamp: now_unix(),
        })
    }

    pub fn failure(request_id: &str, error: impl Into<String>) -> Self {
        GenerationCallback::Failure(GenerationFailure {
            request_id: request_id.to_string(),
            success: false,
            error: error.into(),
            timestamp: now_unix(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GenerationCallback::Success(_))
    }
}

// ---------------------------------------------------------------------------
// Application notification
// ---------------------------------------------------------------------------

/// Sent to the web application after hosted-training weights are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppNotification {
    pub event: String,
    /// Studio row without its `metadata` column.
    pub studio: serde_json::Value,
}

impl AppNotification {
    pub fn training_completed(studio: serde_json::Value) -> Self {
        Self {
            event: TRAINING_COMPLETED_EVENT.to_string(),
            studio,
        }
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
