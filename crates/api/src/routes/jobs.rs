use axum::routing::post;
use axum::Router;

use crate::handlers::{generation, hosted, training};
use crate::state::AppState;

/// Job intake routes, mounted at the root.
///
/// ```text
/// POST /train              -> start_training
/// POST /generate           -> start_generation
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/train", post(training::start_training))
        .route("/generate", post(generation::start_generation))
}

/// Hosted training, which runs its steps inside the request.
///
/// ```text
/// POST /hosted-training    -> hosted_training
/// ```
pub fn hosted_router() -> Router<AppState> {
    Router::new().route("/hosted-training", post(hosted::hosted_training))
}
