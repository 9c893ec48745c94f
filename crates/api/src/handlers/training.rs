//! Handler for `POST /train`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use studio_core::jobs::{TrainingAccepted, TrainingRequest};
use studio_pipeline::spawner::TRAINING_JOBS;

use crate::error::AppResult;
use crate::state::AppState;

/// POST /train
///
/// Validate the request, start the training job in the background and
/// acknowledge with `PROCESSING`. The outcome arrives on `webhook_url`.
pub async fn start_training(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<TrainingAccepted>> {
    let request = TrainingRequest::parse(&body)?;
    let accepted = TrainingAccepted::from(&request);

    let job = Arc::clone(&state.training);
    let studio_id = request.studio_id.clone();
    state.spawner.spawn(
        TRAINING_JOBS,
        studio_id.clone(),
        state.timeouts.training,
        async move {
            job.run(request).await;
        },
    )?;

    tracing::info!(
        studio_id = %studio_id,
        user_id = %accepted.user_id,
        active_jobs = state.spawner.active(),
        "Training job accepted",
    );

    Ok(Json(accepted))
}
