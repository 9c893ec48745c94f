//! Repository for the `headshots` table.

use sqlx::PgPool;

use crate::models::headshot::NewHeadshot;

/// Provides inserts for generated headshots.
pub struct HeadshotRepo;

impl HeadshotRepo {
    /// Insert a headshot and return its id as text.
    pub async fn insert(pool: &PgPool, headshot: &NewHeadshot) -> Result<String, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "INSERT INTO headshots (studio_id, preview, result, hd, prompt) \
             VALUES ($1::uuid, $2, $3, $4, $5) \
             RETURNING id::text",
        )
        .bind(&headshot.studio_id)
        .bind(&headshot.preview)
        .bind(&headshot.result)
        .bind(headshot.hd.as_deref())
        .bind(&headshot.prompt)
        .fetch_one(pool)
        .await
    }
}
