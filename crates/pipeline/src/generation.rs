//! Headshot generation job.
//!
//! Patches the workflow template for one request, renders it on ComfyUI,
//! uploads a watermarked preview plus the standard and HD renditions, records
//! the headshot and reports to the request's webhook.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use studio_cloud::{ObjectStore, PutOptions, StorageError};
use studio_comfyui::{OutputImage, RunError, Workflow, WorkflowError, WorkflowRunner};
use studio_core::jobs::GenerationRequest;
use studio_core::keys::{content_type_for, output_image_key, output_prefix, ImageRole};
use studio_core::retry::RetryPolicy;
use studio_db::models::headshot::NewHeadshot;
use studio_db::records::JobRecords;
use studio_events::payload::GeneratedUrls;
use studio_events::{GenerationCallback, WebhookDelivery};
use uuid::Uuid;

use crate::error::JobError;
use crate::lora_cache::LoraCache;
use crate::watermark::watermark;

pub const PROMPT_NODE: &str = "25";
pub const LORA_NODE: &str = "162";
pub const NOISE_NODES: [&str; 2] = ["65", "70"];

/// `SaveImage` prefix of the standard rendition.
pub const STANDARD_OUTPUT: &str = "standard";
/// `SaveImage` prefix of the HD rendition.
pub const HD_OUTPUT: &str = "8m";

// ---------------------------------------------------------------------------
// Renderer seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn health_check(&self) -> Result<(), RunError>;

    /// Render `workflow` and return saved images whose names start with `output_prefix`.
    async fn render(
        &self,
        workflow: &Workflow,
        output_prefix: &str,
    ) -> Result<Vec<OutputImage>, RunError>;
}

#[async_trait]
impl Renderer for WorkflowRunner {
    async fn health_check(&self) -> Result<(), RunError> {
        WorkflowRunner::health_check(self).await
    }

    async fn render(
        &self,
        workflow: &Workflow,
        output_prefix: &str,
    ) -> Result<Vec<OutputImage>, RunError> {
        self.run(workflow, output_prefix).await
    }
}

// ---------------------------------------------------------------------------
// Workflow patching
// ---------------------------------------------------------------------------

/// LoRA override for node [`LORA_NODE`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoraSelection {
    pub filename: String,
    pub strength: f64,
}

/// Apply a request to a workflow template.
///
/// A missing LoRA node keeps the template's default LoRA; every other node
/// touched here must exist.
pub fn patch_workflow(
    workflow: &mut Workflow,
    request_id: &str,
    prompt: &str,
    lora: Option<&LoraSelection>,
    seeds: [u32; 2],
) -> Result<(), WorkflowError> {
    workflow.set_input(PROMPT_NODE, "prompt", prompt)?;

    if let Some(lora) = lora {
        let applied = workflow
            .set_input(LORA_NODE, "lora_name", lora.filename.as_str())
            .and_then(|_| workflow.set_input(LORA_NODE, "strength_model", lora.strength))
            .and_then(|_| workflow.set_input(LORA_NODE, "strength_clip", lora.strength));
        if let Err(e) = applied {
            tracing::warn!(error = %e, "Could not apply LoRA, keeping template default");
        }
    }

    for (node, seed) in NOISE_NODES.iter().zip(seeds) {
        workflow.set_input(node, "noise_seed", seed)?;
    }

    for node in workflow.nodes_of_class("SaveImage") {
        let prefix = workflow
            .input(&node, "filename_prefix")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(prefix) = prefix.filter(|p| p == STANDARD_OUTPUT || p == HD_OUTPUT) {
            workflow.set_input(&node, "filename_prefix", format!("{request_id}_{prefix}"))?;
        }
    }
    Ok(())
}

/// Split rendered images into the standard and optional HD rendition.
///
/// When a rendition appears more than once, the last image wins.
pub fn classify_outputs(
    images: Vec<OutputImage>,
) -> Result<(OutputImage, Option<OutputImage>), JobError> {
    if images.is_empty() {
        return Err(JobError::Generation("No images generated".to_string()));
    }

    let mut standard = None;
    let mut hd = None;
    for image in images {
        if image.filename.contains(STANDARD_OUTPUT) {
            standard = Some(image);
        } else if image.filename.contains(HD_OUTPUT) {
            hd = Some(image);
        }
    }

    let standard =
        standard.ok_or_else(|| JobError::Generation("No standard image generated".to_string()))?;
    if hd.is_none() {
        tracing::warn!(standard = %standard.filename, "No HD image generated");
    }
    Ok((standard, hd))
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub workflow_path: PathBuf,
    pub output_bucket: String,
    /// Prepended to object keys to form the URLs sent to clients.
    pub public_base_url: String,
}

impl GenerationSettings {
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base_url.trim_end_matches('/'))
    }
}

pub struct GenerationJob {
    pub store: Arc<dyn ObjectStore>,
    pub records: Arc<dyn JobRecords>,
    pub renderer: Arc<dyn Renderer>,
    pub lora_cache: LoraCache,
    pub webhooks: WebhookDelivery,
    pub settings: GenerationSettings,
}

impl GenerationJob {
    pub async fn run(&self, request_id: String, request: GenerationRequest) -> GenerationCallback {
        tracing::info!(
            request_id = %request_id,
            studio_id = %request.studio_id,
            "Generation job started",
        );

        let callback = match self.generate(&request_id, &request).await {
            Ok((headshot_id, urls)) => {
                tracing::info!(
                    request_id = %request_id,
                    headshot_id = %headshot_id,
                    "Generation job completed",
                );
                GenerationCallback::success(&request_id, headshot_id, urls, &request.prompt)
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Generation job failed");
                GenerationCallback::failure(&request_id, e.to_string())
            }
        };

        if let Some(url) = request.webhook() {
            let outcome = self.webhooks.deliver(url, &callback).await;
            tracing::debug!(
                request_id = %request_id,
                delivered = outcome.is_delivered(),
                "Generation webhook sent",
            );
        }
        callback
    }

    async fn generate(
        &self,
        request_id: &str,
        request: &GenerationRequest,
    ) -> Result<(String, GeneratedUrls), JobError> {
        let images = self
            .prepare_and_render(request_id, request)
            .await
            .map_err(|e| JobError::Generation(format!("Workflow preparation failed: {e}")))?;

        let (standard, hd) = classify_outputs(images)?;

        let standard_bytes = standard.bytes.clone();
        let preview = tokio::task::spawn_blocking(move || watermark(&standard_bytes))
            .await
            .map_err(|e| JobError::Generation(format!("Watermark task failed: {e}")))??;

        let prefix = output_prefix(&request.user_id, &request.studio_id, request_id);
        let preview_key = self.upload(&prefix, ImageRole::Preview, preview).await?;
        let standard_key = self.upload(&prefix, ImageRole::Standard, standard.bytes).await?;
        let hd_key = match hd {
            Some(hd) => Some(self.upload(&prefix, ImageRole::Hd, hd.bytes).await?),
            None => None,
        };

        let headshot = NewHeadshot {
            studio_id: request.studio_id.clone(),
            preview: preview_key.clone(),
            result: standard_key.clone(),
            hd: hd_key.clone(),
            prompt: request.prompt.clone(),
        };
        let records = &*self.records;
        let headshot_id = RetryPolicy::RECORD_INSERT
            .run("insert headshot", || records.insert_headshot(&headshot))
            .await?;

        Ok((
            headshot_id,
            GeneratedUrls {
                preview_url: self.settings.public_url(&preview_key),
                result_url: self.settings.public_url(&standard_key),
                hd_url: hd_key.as_deref().map(|key| self.settings.public_url(key)),
            },
        ))
    }

    async fn prepare_and_render(
        &self,
        request_id: &str,
        request: &GenerationRequest,
    ) -> Result<Vec<OutputImage>, JobError> {
        let mut workflow = Workflow::load(&self.settings.workflow_path).await?;

        let lora = match request.lora_key() {
            Some(key) => match self.lora_cache.resolve(&*self.store, key).await {
                Ok(filename) => Some(LoraSelection {
                    filename,
                    strength: request.lora_strength,
                }),
                Err(e) => {
                    tracing::warn!(
                        request_id,
                        key,
                        error = %e,
                        "LoRA unavailable, using template default",
                    );
                    None
                }
            },
            None => None,
        };

        let seeds = [rand::random::<u32>(), rand::random::<u32>()];
        patch_workflow(&mut workflow, request_id, &request.prompt, lora.as_ref(), seeds)?;

        self.renderer.health_check().await?;
        let images = self.renderer.render(&workflow, request_id).await?;
        tracing::info!(request_id, count = images.len(), "Workflow rendered");
        Ok(images)
    }

    async fn upload(
        &self,
        prefix: &str,
        role: ImageRole,
        bytes: Vec<u8>,
    ) -> Result<String, JobError> {
        let key = output_image_key(prefix, role, Uuid::new_v4());
        let bucket = self.settings.output_bucket.as_str();
        let store = &*self.store;
        let size = bytes.len();
        let content_type = content_type_for(&key);

        RetryPolicy::STANDARD
            .run_if(
                "upload generated image",
                || store.put(bucket, &key, bytes.clone(), PutOptions::content_type(content_type)),
                StorageError::is_retryable,
            )
            .await?;
        tracing::debug!(key = %key, role = %role, size, "Uploaded generated image");
        Ok(key)
    }
}
