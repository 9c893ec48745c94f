use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use studio_cloud::StorageError;
use studio_core::error::CoreError;
use studio_pipeline::spawner::SpawnError;
use studio_pipeline::JobError;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for request validation and [`JobError`] for work done
/// inline by a handler. Implements [`IntoResponse`] to produce consistent
/// JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A failure from a job step run inside the request.
    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A route whose backing service is not configured.
    #[error("{0}")]
    NotConfigured(&'static str),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, key } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} not found: {key}"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                CoreError::Unauthorized(msg) => {
                    (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
                }
                CoreError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
                CoreError::Internal(msg) => internal("Internal core error", msg),
            },

            // --- Job errors ---
            AppError::Job(err) => classify_job_error(err),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Spawn(err) => internal("Failed to start background job", &err.to_string()),
            AppError::NotConfigured(msg) => {
                tracing::error!(error = %msg, "Route called without configuration");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "NOT_CONFIGURED",
                    msg.to_string(),
                )
            }
            AppError::InternalError(msg) => internal("Internal error", msg),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn internal(context: &'static str, detail: &str) -> (StatusCode, &'static str, String) {
    tracing::error!(error = %detail, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

/// Classify a job error into an HTTP status, error code, and message.
///
/// - `Invalid` maps to 400, `Unauthorized` to 401.
/// - Missing or denied objects map to 404 and 403.
/// - Everything else maps to 500. The message is kept, since job errors are
///   written to be read by the calling application.
fn classify_job_error(err: &JobError) -> (StatusCode, &'static str, String) {
    match err {
        JobError::Invalid(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        JobError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
        JobError::Storage(StorageError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
        }
        JobError::Storage(StorageError::AccessDenied { .. }) => {
            (StatusCode::FORBIDDEN, "FORBIDDEN", err.to_string())
        }
        other => {
            tracing::error!(error = %other, "Job step failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                other.to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn render(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let err = CoreError::Validation("Missing required field: prompt".into());
        let (status, body) = render(err.into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"], "Missing required field: prompt");
    }

    #[tokio::test]
    async fn storage_errors_keep_their_status() {
        let missing = JobError::from(StorageError::NotFound {
            bucket: "datasets".into(),
            key: "u1/s1/crop_data.json".into(),
        });
        let (status, body) = render(missing.into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");

        let denied = JobError::from(StorageError::AccessDenied {
            bucket: "datasets".into(),
            key: "u1/s1/crop_data.json".into(),
        });
        let (status, _) = render(denied.into()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unauthorized_job_errors_are_401() {
        let (status, body) =
            render(JobError::Unauthorized("Invalid webhook secret".into()).into()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid webhook secret");
    }

    #[tokio::test]
    async fn internal_details_are_not_leaked() {
        let (status, body) = render(AppError::InternalError("pool exhausted".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "An internal error occurred");

        let (status, body) = render(SpawnError::ShuttingDown.into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "INTERNAL_ERROR");
    }
}
