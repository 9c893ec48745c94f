//! Handler for `POST /generate`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use studio_core::jobs::{GenerationAccepted, GenerationRequest};
use studio_pipeline::spawner::GENERATION_JOBS;
use uuid::Uuid;

use crate::error::AppResult;
use crate::state::AppState;

/// POST /generate
///
/// Assign a request id and render in the background. The id is echoed in
/// the response and in the completion webhook.
pub async fn start_generation(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<GenerationAccepted>> {
    let request = GenerationRequest::parse(&body)?;
    let request_id = Uuid::new_v4().simple().to_string();

    tracing::info!(
        request_id = %request_id,
        studio_id = %request.studio_id,
        user_id = %request.user_id,
        has_lora = request.lora_object_key.is_some(),
        "Generation request accepted",
    );

    let job = Arc::clone(&state.generation);
    let id = request_id.clone();
    state.spawner.spawn(
        GENERATION_JOBS,
        request_id.clone(),
        state.timeouts.generation,
        async move {
            job.run(id, request).await;
        },
    )?;

    Ok(Json(GenerationAccepted::new(request_id)))
}
