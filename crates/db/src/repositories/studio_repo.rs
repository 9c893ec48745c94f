//! Repository for the `studios` table.

use sqlx::PgPool;

use crate::models::studio::{StudioSnapshot, StudioWeights, PRIVATE_COLUMN, STATUS_COMPLETED};

/// Provides the studio updates issued by training jobs.
pub struct StudioRepo;

impl StudioRepo {
    /// Set `status = 'COMPLETED'`. Returns the number of rows touched.
    pub async fn mark_completed(pool: &PgPool, studio_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE studios SET status = $2 WHERE id::text = $1")
            .bind(studio_id)
            .bind(STATUS_COMPLETED)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Attach hosted-training weights. Returns the number of rows touched.
    pub async fn set_weights(
        pool: &PgPool,
        studio_id: &str,
        weights: &StudioWeights,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE studios SET weights = $2, provider_id = $3 WHERE id::text = $1",
        )
        .bind(studio_id)
        .bind(&weights.weights)
        .bind(&weights.provider_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Read a studio row as JSON without its private column.
    pub async fn find_snapshot(
        pool: &PgPool,
        studio_id: &str,
    ) -> Result<Option<StudioSnapshot>, sqlx::Error> {
        let query = format!(
            "SELECT to_jsonb(s) - '{PRIVATE_COLUMN}' FROM studios s WHERE s.id::text = $1"
        );
        sqlx::query_scalar::<_, serde_json::Value>(&query)
            .bind(studio_id)
            .fetch_optional(pool)
            .await
    }
}
