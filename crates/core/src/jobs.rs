//! Inbound job requests and their immediate acknowledgements.
//!
//! Bodies are parsed from raw bytes rather than through an extractor so that
//! malformed JSON and missing fields both surface as
//! [`CoreError::Validation`] (HTTP 400) with the messages clients expect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError};

use crate::error::CoreError;

pub const DEFAULT_TRAINING_STEPS: u32 = 3000;
pub const DEFAULT_TRIGGER_WORD: &str = "ohwx";
pub const DEFAULT_LORA_STRENGTH: f64 = 1.0;

/// Studio status reported when a training job is accepted.
pub const STATUS_PROCESSING: &str = "PROCESSING";

/// Provider status that triggers weights ingestion.
pub const PROVIDER_SUCCEEDED: &str = "succeeded";

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

/// `POST /train` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TrainingRequest {
    #[validate(length(min = 1))]
    pub object_key: String,
    pub gender: String,
    #[validate(length(min = 1))]
    pub user_id: String,
    pub plan: String,
    /// Names the job's local work directories.
    #[validate(length(min = 1), custom(function = "path_segment"))]
    pub studio_id: String,
    #[serde(default = "default_steps")]
    #[validate(range(min = 1))]
    pub steps: u32,
    #[serde(default = "default_trigger_word")]
    #[validate(length(min = 1))]
    pub trigger_word: String,
    /// Empty means no completion callback.
    #[serde(default)]
    pub webhook_url: String,
}

/// A single directory-name component: ASCII alphanumerics, `-`, `_` and `.`,
/// never `.` or `..` on its own.
fn path_segment(value: &str) -> Result<(), ValidationError> {
    let allowed = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if allowed && value != "." && value != ".." {
        Ok(())
    } else {
        Err(ValidationError::new("path_segment")
            .with_message("must be a single path segment of [A-Za-z0-9._-]".into()))
    }
}

fn default_steps() -> u32 {
    DEFAULT_TRAINING_STEPS
}

fn default_trigger_word() -> String {
    DEFAULT_TRIGGER_WORD.to_string()
}

impl TrainingRequest {
    pub fn parse(body: &[u8]) -> Result<Self, CoreError> {
        let request: Self = serde_json::from_slice(body)
            .map_err(|e| CoreError::Validation(format!("Invalid training request: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn webhook(&self) -> Option<&str> {
        non_empty(&self.webhook_url)
    }
}

/// `POST /train` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingAccepted {
    pub studio_id: String,
    pub status: String,
    pub user_id: String,
    pub webhook_url: String,
}

impl From<&TrainingRequest> for TrainingAccepted {
    fn from(request: &TrainingRequest) -> Self {
        Self {
            studio_id: request.studio_id.clone(),
            status: STATUS_PROCESSING.to_string(),
            user_id: request.user_id.clone(),
            webhook_url: request.webhook_url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Fields checked, in order, before a generation body is deserialized.
pub const GENERATION_REQUIRED_FIELDS: [&str; 3] = ["prompt", "user_id", "studio_id"];

/// `POST /generate` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub user_id: String,
    pub studio_id: String,
    #[serde(default)]
    pub lora_object_key: Option<String>,
    #[serde(default = "default_lora_strength")]
    pub lora_strength: f64,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_lora_strength() -> f64 {
    DEFAULT_LORA_STRENGTH
}

impl GenerationRequest {
    pub fn parse(body: &[u8]) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| CoreError::Validation("Invalid JSON payload".to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| CoreError::Validation("Request body must be a JSON object".into()))?;

        if let Some(field) = GENERATION_REQUIRED_FIELDS
            .iter()
            .find(|field| !object.contains_key(**field))
        {
            return Err(CoreError::Validation(format!(
                "Missing required field: {field}"
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| CoreError::Validation(format!("Invalid generation request: {e}")))
    }

    pub fn webhook(&self) -> Option<&str> {
        self.webhook_url.as_deref().and_then(non_empty)
    }

    pub fn lora_key(&self) -> Option<&str> {
        self.lora_object_key.as_deref().and_then(non_empty)
    }
}

/// `POST /generate` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAccepted {
    pub status: String,
    pub message: String,
    pub request_id: String,
}

impl GenerationAccepted {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: "Request accepted and is being processed.".to_string(),
            request_id: request_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Hosted training
// ---------------------------------------------------------------------------

const HOSTED_TRAINING_FIELDS: [&str; 5] = ["object_key", "gender", "user_id", "plan", "studio_id"];
const PROVIDER_CALLBACK_FIELDS: [&str; 2] = ["id", "status"];

/// Dataset submission for the hosted trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedTrainingRequest {
    pub object_key: String,
    pub gender: String,
    pub user_id: String,
    pub plan: String,
    pub studio_id: String,
}

/// Completion notice posted back by the hosted training provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCallback {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProviderCallback {
    pub fn succeeded(&self) -> bool {
        self.status == PROVIDER_SUCCEEDED
    }

    /// First output value that points at a `.tar` archive.
    pub fn trained_model_url(&self) -> Option<&str> {
        match self.output.as_ref()? {
            Value::String(url) if url.ends_with(".tar") => Some(url.as_str()),
            Value::Object(map) => map
                .values()
                .filter_map(Value::as_str)
                .find(|url| url.ends_with(".tar")),
            _ => None,
        }
    }
}

/// `POST /hosted-training` bodies, told apart by the keys they carry.
#[derive(Debug, Clone, PartialEq)]
pub enum HostedBody {
    Training(HostedTrainingRequest),
    Callback(ProviderCallback),
}

impl HostedBody {
    pub fn parse(body: &[u8]) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| CoreError::Validation("Invalid JSON payload".to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(CoreError::Validation("Invalid JSON payload".to_string()));
        };

        let has_all = |fields: &[&str]| fields.iter().all(|f| object.contains_key(*f));

        if has_all(&HOSTED_TRAINING_FIELDS) {
            serde_json::from_value(value)
                .map(HostedBody::Training)
                .map_err(|e| CoreError::Validation(format!("Invalid training request: {e}")))
        } else if has_all(&PROVIDER_CALLBACK_FIELDS) {
            serde_json::from_value(value)
                .map(HostedBody::Callback)
                .map_err(|e| CoreError::Validation(format!("Invalid provider callback: {e}")))
        } else {
            let keys: Vec<String> = object.keys().map(|k| format!("'{k}'")).collect();
            Err(CoreError::Validation(format!(
                "Unknown request type. Keys found: [{}]",
                keys.join(", ")
            )))
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
