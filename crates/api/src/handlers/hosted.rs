//! Handler for `POST /hosted-training`.
//!
//! One route serves two callers: the application submitting a dataset, and
//! the training provider reporting a finished run. The body shape decides
//! which one is talking.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use studio_core::jobs::HostedBody;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Query parameters the provider echoes back from the callback URL.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub user_id: Option<String>,
    pub studio_id: Option<String>,
    pub secret: Option<String>,
}

/// POST /hosted-training
pub async fn hosted_training(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let body = HostedBody::parse(&body)?;
    let service = state
        .hosted
        .as_ref()
        .ok_or(AppError::NotConfigured("Hosted training is not configured"))?;

    match body {
        HostedBody::Training(request) => {
            tracing::info!(
                studio_id = %request.studio_id,
                user_id = %request.user_id,
                "Hosted training requested",
            );
            Ok(Json(service.start(&request).await?))
        }
        HostedBody::Callback(callback) => {
            let (Some(user_id), Some(studio_id)) = (
                non_empty(query.user_id.as_deref()),
                non_empty(query.studio_id.as_deref()),
            ) else {
                return Err(AppError::BadRequest(
                    "Missing user_id or studio_id in query params".to_string(),
                ));
            };
            service.verify_secret(query.secret.as_deref())?;

            tracing::info!(
                studio_id,
                provider_id = %callback.id,
                status = %callback.status,
                "Hosted training callback received",
            );
            Ok(Json(service.complete(user_id, studio_id, &callback).await?))
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
