//! The record-keeping seam used by background jobs.
//!
//! [`PgJobRecords`] forwards to the repositories; [`MemoryRecords`] keeps rows
//! in memory and can be told to fail, for job and handler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::headshot::NewHeadshot;
use crate::models::studio::{StudioSnapshot, StudioWeights, PRIVATE_COLUMN, STATUS_COMPLETED};
use crate::repositories::{HeadshotRepo, StudioRepo};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Records unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    /// Whether repeating the same statement could succeed.
    ///
    /// Constraint, data and schema errors (SQLSTATE classes 22, 23, 42) and
    /// decoding problems are permanent; connection-level failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Query(sqlx::Error::Database(db)) => !matches!(
                db.code().as_deref().map(|code| &code[..code.len().min(2)]),
                Some("22" | "23" | "42")
            ),
            DbError::Query(
                sqlx::Error::RowNotFound
                | sqlx::Error::ColumnNotFound(_)
                | sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::Decode(_)
                | sqlx::Error::TypeNotFound { .. }
                | sqlx::Error::Configuration(_),
            ) => false,
            DbError::Query(_) | DbError::Unavailable(_) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Database writes and reads performed by background jobs.
#[async_trait]
pub trait JobRecords: Send + Sync {
    /// Mark a studio `COMPLETED`. `Ok(false)` when no row matched.
    async fn mark_studio_completed(&self, studio_id: &str) -> Result<bool, DbError>;

    /// Attach hosted-training weights. `Ok(false)` when no row matched.
    async fn record_hosted_weights(
        &self,
        studio_id: &str,
        weights: &StudioWeights,
    ) -> Result<bool, DbError>;

    /// The studio row without `metadata`, if it exists.
    async fn fetch_studio_snapshot(&self, studio_id: &str)
        -> Result<Option<StudioSnapshot>, DbError>;

    /// Insert a generated headshot and return its id.
    async fn insert_headshot(&self, headshot: &NewHeadshot) -> Result<String, DbError>;

    async fn health_check(&self) -> Result<(), DbError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// [`JobRecords`] backed by the managed Postgres database.
#[derive(Clone)]
pub struct PgJobRecords {
    pool: PgPool,
}

impl PgJobRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobRecords for PgJobRecords {
    async fn mark_studio_completed(&self, studio_id: &str) -> Result<bool, DbError> {
        let rows = StudioRepo::mark_completed(&self.pool, studio_id).await?;
        Ok(rows > 0)
    }

    async fn record_hosted_weights(
        &self,
        studio_id: &str,
        weights: &StudioWeights,
    ) -> Result<bool, DbError> {
        let rows = StudioRepo::set_weights(&self.pool, studio_id, weights).await?;
        Ok(rows > 0)
    }

    async fn fetch_studio_snapshot(
        &self,
        studio_id: &str,
    ) -> Result<Option<StudioSnapshot>, DbError> {
        Ok(StudioRepo::find_snapshot(&self.pool, studio_id).await?)
    }

    async fn insert_headshot(&self, headshot: &NewHeadshot) -> Result<String, DbError> {
        Ok(HeadshotRepo::insert(&self.pool, headshot).await?)
    }

    async fn health_check(&self) -> Result<(), DbError> {
        Ok(crate::health_check(&self.pool).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// [`JobRecords`] over in-process maps.
#[derive(Default)]
pub struct MemoryRecords {
    studios: Mutex<HashMap<String, serde_json::Value>>,
    headshots: Mutex<Vec<(String, NewHeadshot)>>,
    failures_pending: AtomicU32,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a studio row. Non-object rows are stored as `{"id": studio_id}`.
    pub fn with_studio(self, studio_id: &str, row: serde_json::Value) -> Self {
        let row = if row.is_object() {
            row
        } else {
            serde_json::json!({ "id": studio_id })
        };
        lock(&self.studios).insert(studio_id.to_string(), row);
        self
    }

    /// Make the next `count` calls fail with [`DbError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Full stored studio row, including private columns.
    pub fn studio(&self, studio_id: &str) -> Option<serde_json::Value> {
        lock(&self.studios).get(studio_id).cloned()
    }

    pub fn headshots(&self) -> Vec<(String, NewHeadshot)> {
        lock(&self.headshots).clone()
    }

    fn injected_failure(&self) -> Result<(), DbError> {
        let took = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(DbError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn update_studio(
        &self,
        studio_id: &str,
        apply: impl FnOnce(&mut serde_json::Map<String, serde_json::Value>),
    ) -> bool {
        let mut studios = lock(&self.studios);
        match studios.get_mut(studio_id).and_then(|row| row.as_object_mut()) {
            Some(row) => {
                apply(row);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobRecords for MemoryRecords {
    async fn mark_studio_completed(&self, studio_id: &str) -> Result<bool, DbError> {
        self.injected_failure()?;
        Ok(self.update_studio(studio_id, |row| {
            row.insert("status".into(), STATUS_COMPLETED.into());
        }))
    }

    async fn record_hosted_weights(
        &self,
        studio_id: &str,
        weights: &StudioWeights,
    ) -> Result<bool, DbError> {
        self.injected_failure()?;
        Ok(self.update_studio(studio_id, |row| {
            row.insert("weights".into(), weights.weights.clone().into());
            row.insert("provider_id".into(), weights.provider_id.clone().into());
        }))
    }

    async fn fetch_studio_snapshot(
        &self,
        studio_id: &str,
    ) -> Result<Option<StudioSnapshot>, DbError> {
        self.injected_failure()?;
        Ok(self.studio(studio_id).map(|mut row| {
            if let Some(object) = row.as_object_mut() {
                object.remove(PRIVATE_COLUMN);
            }
            row
        }))
    }

    async fn insert_headshot(&self, headshot: &NewHeadshot) -> Result<String, DbError> {
        self.injected_failure()?;
        let mut headshots = lock(&self.headshots);
        let id = format!("headshot-{}", headshots.len() + 1);
        headshots.push((id.clone(), headshot.clone()));
        Ok(id)
    }

    async fn health_check(&self) -> Result<(), DbError> {
        self.injected_failure()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn headshot() -> NewHeadshot {
        NewHeadshot {
            studio_id: "s1".into(),
            preview: "u/s1/r/preview_a.png".into(),
            result: "u/s1/r/standard_b.png".into(),
            hd: None,
            prompt: "a portrait".into(),
        }
    }

    #[tokio::test]
    async fn memory_records_update_existing_studios_only() {
        let records =
            MemoryRecords::new().with_studio("s1", json!({"id": "s1", "status": "PENDING"}));

        assert!(records.mark_studio_completed("s1").await.unwrap());
        assert!(!records.mark_studio_completed("missing").await.unwrap());
        assert_eq!(records.studio("s1").unwrap()["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn snapshot_drops_metadata() {
        let records = MemoryRecords::new().with_studio(
            "s1",
            json!({"id": "s1", "metadata": {"secret": true}, "weights": null}),
        );
        let weights = StudioWeights {
            weights: "u/s1/lora.safetensors".into(),
            provider_id: "train-1".into(),
        };
        assert!(records.record_hosted_weights("s1", &weights).await.unwrap());

        let snapshot = records.fetch_studio_snapshot("s1").await.unwrap().unwrap();
        assert!(snapshot.get("metadata").is_none());
        assert_eq!(snapshot["weights"], "u/s1/lora.safetensors");
        assert_eq!(snapshot["provider_id"], "train-1");
        assert!(records.studio("s1").unwrap().get("metadata").is_some());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let records = MemoryRecords::new();
        records.fail_next(2);

        assert_matches!(records.insert_headshot(&headshot()).await, Err(DbError::Unavailable(_)));
        assert_matches!(records.health_check().await, Err(DbError::Unavailable(_)));
        assert_eq!(records.insert_headshot(&headshot()).await.unwrap(), "headshot-1");
        assert_eq!(records.headshots().len(), 1);
    }

    #[test]
    fn row_not_found_is_not_retryable() {
        assert!(!DbError::Query(sqlx::Error::RowNotFound).is_retryable());
        assert!(DbError::Query(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(DbError::Unavailable("down".into()).is_retryable());
    }
}
