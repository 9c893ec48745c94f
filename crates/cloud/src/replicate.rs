//! Client for the hosted LoRA training provider (Replicate).

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::Url;
use serde::Serialize;

pub const DEFAULT_API_BASE: &str = "https://api.replicate.com/v1";

/// Trained weights archives can be large.
const OUTPUT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Completion is the only provider event the callback handles.
const WEBHOOK_EVENTS: [&str; 1] = ["completed"];

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReplicateError {
    #[error("Training provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Training provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid training provider URL: {0}")]
    Url(String),
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Which trainer version runs and which model receives the result.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingTarget {
    pub owner: String,
    pub model: String,
    pub version: String,
    /// `<owner>/<model>` receiving the trained version.
    pub destination: String,
}

/// Trainer input. Everything but the dataset URL is fixed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingInput {
    pub input_images: String,
    pub steps: u32,
    pub lora_rank: u32,
    pub learning_rate: f64,
    pub optimizer: String,
    pub batch_size: u32,
    pub resolution: String,
    pub autocaption: bool,
    pub trigger_word: String,
    pub caption_dropout_rate: f64,
}

impl TrainingInput {
    pub fn for_dataset(input_images: impl Into<String>) -> Self {
        Self {
            input_images: input_images.into(),
            steps: 3000,
            lora_rank: 32,
            learning_rate: 0.0001,
            optimizer: "adamw".into(),
            batch_size: 1,
            resolution: "1024".into(),
            autocaption: false,
            trigger_word: "ohwx".into(),
            caption_dropout_rate: 0.05,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateTraining<'a> {
    destination: &'a str,
    input: &'a TrainingInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook: Option<&'a str>,
    webhook_events_filter: &'a [&'a str],
}

/// `<base>?user_id=..&studio_id=..&secret=..`, query values percent-encoded.
pub fn callback_url(
    base: &str,
    user_id: &str,
    studio_id: &str,
    secret: Option<&str>,
) -> Result<String, ReplicateError> {
    let mut url = Url::parse(base).map_err(|e| ReplicateError::Url(format!("{base}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("user_id", user_id);
        query.append_pair("studio_id", studio_id);
        if let Some(secret) = secret {
            query.append_pair("secret", secret);
        }
    }
    Ok(url.into())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ReplicateClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl ReplicateClient {
    pub fn new(api_base: &str, token: impl Into<String>) -> Result<Self, ReplicateError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Start a training run. Returns the provider's training object as-is.
    pub async fn create_training(
        &self,
        target: &TrainingTarget,
        input: &TrainingInput,
        webhook: Option<&str>,
    ) -> Result<serde_json::Value, ReplicateError> {
        let url = format!(
            "{}/models/{}/{}/versions/{}/trainings",
            self.api_base, target.owner, target.model, target.version
        );
        let body = CreateTraining {
            destination: &target.destination,
            input,
            webhook,
            webhook_events_filter: &WEBHOOK_EVENTS,
        };

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplicateError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let training: serde_json::Value = response.json().await?;
        tracing::info!(
            training_id = training.get("id").and_then(|v| v.as_str()).unwrap_or_default(),
            destination = %target.destination,
            "Hosted training started",
        );
        Ok(training)
    }

    /// Fetch a training output file (the weights archive).
    pub async fn download_output(&self, url: &str) -> Result<Vec<u8>, ReplicateError> {
        let response = self
            .client
            .get(url)
            .timeout(OUTPUT_DOWNLOAD_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReplicateError::Api {
                status: status.as_u16(),
                body: format!("download of {url} failed"),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
