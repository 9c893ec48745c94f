//! Run a workflow to completion and collect the images it saved.
//!
//! The socket is opened before the prompt is queued so no progress frame is
//! missed. The whole wait is bounded; on timeout the server is told to
//! interrupt and drop the prompt.

use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIClientError};
use crate::messages::{parse_message, ComfyUIMessage};
use crate::workflow::Workflow;

/// Default bound on a single render.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(1200);

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Connection(#[from] ComfyUIClientError),

    #[error("ComfyUI server is not healthy: {0}")]
    Unhealthy(String),

    #[error("Node {node_id} failed ({exception_type}): {message}")]
    Execution {
        node_id: String,
        exception_type: String,
        message: String,
    },

    #[error("Execution was interrupted")]
    Interrupted,

    #[error("Workflow did not finish within {0}s")]
    Timeout(u64),

    #[error("ComfyUI closed the connection before the workflow finished")]
    SocketClosed,
}

/// A file listed in a prompt's history outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
}

/// A downloaded output image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct WorkflowRunner {
    api: ComfyUIApi,
    client: ComfyUIClient,
    timeout: Duration,
}

impl WorkflowRunner {
    pub fn new(api_url: &str, timeout: Duration) -> Self {
        Self {
            api: ComfyUIApi::new(api_url),
            client: ComfyUIClient::from_api_url(api_url.trim_end_matches('/')),
            timeout,
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub async fn health_check(&self) -> Result<(), RunError> {
        match self.api.system_stats().await {
            Ok(_) => {
                tracing::debug!(api_url = %self.api.api_url(), "ComfyUI server is healthy");
                Ok(())
            }
            Err(e) => Err(RunError::Unhealthy(e.to_string())),
        }
    }

    /// Submit `workflow`, wait for it, then download every output image whose
    /// filename starts with `output_prefix`.
    pub async fn run(
        &self,
        workflow: &Workflow,
        output_prefix: &str,
    ) -> Result<Vec<OutputImage>, RunError> {
        let mut connection = self.client.connect().await?;
        let submitted = self
            .api
            .submit_workflow(&workflow.to_value(), &connection.client_id)
            .await?;
        let prompt_id = submitted.prompt_id;
        tracing::info!(
            prompt_id = %prompt_id,
            queue_position = submitted.number,
            "Workflow queued",
        );

        let completion = wait_for_prompt(&mut connection.ws_stream, &prompt_id);
        let waited = tokio::time::timeout(self.timeout, completion).await;
        let _ = connection.ws_stream.close(None).await;

        match waited {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    prompt_id = %prompt_id,
                    timeout_secs = self.timeout.as_secs(),
                    "Workflow timed out, interrupting",
                );
                if let Err(e) = self.api.interrupt().await {
                    tracing::warn!(error = %e, "Failed to interrupt ComfyUI");
                }
                if let Err(e) = self.api.cancel_execution(&prompt_id).await {
                    tracing::warn!(error = %e, "Failed to remove prompt from queue");
                }
                return Err(RunError::Timeout(self.timeout.as_secs()));
            }
        }

        let history = self.api.get_history(&prompt_id).await?;
        let refs = history_images(&history, &prompt_id, output_prefix);

        let mut images = Vec::with_capacity(refs.len());
        for image in refs {
            let bytes = self
                .api
                .view_image(&image.filename, &image.subfolder, &image.kind)
                .await?;
            tracing::debug!(
                filename = %image.filename,
                size = bytes.len(),
                "Downloaded output image",
            );
            images.push(OutputImage {
                filename: image.filename,
                bytes,
            });
        }
        Ok(images)
    }
}

/// Read frames until `prompt_id` finishes or fails.
pub async fn wait_for_prompt<S>(stream: &mut S, prompt_id: &str) -> Result<(), RunError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return Err(RunError::SocketClosed),
            // Binary frames are live previews.
            Ok(_) => continue,
            Err(e) => return Err(ComfyUIClientError::Protocol(e.to_string()).into()),
        };

        let Ok(message) = parse_message(&text) else {
            continue;
        };
        if let Some(outcome) = completion(&message, prompt_id) {
            return outcome;
        }
    }
    Err(RunError::SocketClosed)
}

/// `Some` once `message` ends the run of `prompt_id`.
pub fn completion(message: &ComfyUIMessage, prompt_id: &str) -> Option<Result<(), RunError>> {
    if message.prompt_id() != Some(prompt_id) {
        return None;
    }
    match message {
        ComfyUIMessage::Executing(data) if data.node.is_none() => Some(Ok(())),
        ComfyUIMessage::ExecutionSuccess(_) => Some(Ok(())),
        ComfyUIMessage::ExecutionError(data) => Some(Err(RunError::Execution {
            node_id: data.node_id.clone(),
            exception_type: data.exception_type.clone(),
            message: data.exception_message.clone(),
        })),
        ComfyUIMessage::ExecutionInterrupted(_) => Some(Err(RunError::Interrupted)),
        ComfyUIMessage::Progress(data) => {
            tracing::trace!(prompt_id, value = data.value, max = data.max, "Render progress");
            None
        }
        _ => None,
    }
}

/// Saved images of `prompt_id` whose filename starts with `prefix`.
pub fn history_images(history: &Value, prompt_id: &str, prefix: &str) -> Vec<ImageRef> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };

    outputs
        .values()
        .filter_map(|node| node.get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|image| {
            let filename = image.get("filename")?.as_str()?;
            let kind = image.get("type").and_then(Value::as_str).unwrap_or("output");
            (filename.starts_with(prefix) && kind == "output").then(|| ImageRef {
                filename: filename.to_string(),
                subfolder: image
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                kind: kind.to_string(),
            })
        })
        .collect()
}
