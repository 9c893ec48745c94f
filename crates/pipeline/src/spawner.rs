//! Detached background jobs with a concurrency bound.
//!
//! Handlers hand a job future to [`JobSpawner::spawn`] and return. Each job
//! waits for a permit from its kind's pool, then runs under its own timeout.
//! Kinds without a pool of their own share the default pool. Shutdown closes
//! the tracker, waits out a grace period and cancels whatever is left.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// Job kind for local LoRA training.
pub const TRAINING_JOBS: &str = "training";

/// Job kind for headshot generation.
pub const GENERATION_JOBS: &str = "generation";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Job spawner is shutting down")]
    ShuttingDown,
}

#[derive(Clone)]
pub struct JobSpawner {
    default_permits: Arc<Semaphore>,
    pools: Arc<HashMap<&'static str, Arc<Semaphore>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl JobSpawner {
    /// Spawner whose kinds all share one pool of `max_concurrent` permits.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            default_permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pools: Arc::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Give jobs of `kind` their own pool of `max_concurrent` permits.
    pub fn with_pool(mut self, kind: &'static str, max_concurrent: usize) -> Self {
        Arc::make_mut(&mut self.pools)
            .insert(kind, Arc::new(Semaphore::new(max_concurrent.max(1))));
        self
    }

    /// Jobs queued or running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    pub fn spawn<F>(
        &self,
        kind: &'static str,
        job_id: impl Into<String>,
        timeout: Duration,
        job: F,
    ) -> Result<(), SpawnError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() || self.cancel.is_cancelled() {
            return Err(SpawnError::ShuttingDown);
        }

        let job_id = job_id.into();
        let permits = self
            .pools
            .get(kind)
            .unwrap_or(&self.default_permits)
            .clone();
        let cancel = self.cancel.clone();
        let span = tracing::info_span!("job", kind, job_id = %job_id);

        self.tracker.spawn(
            async move {
                let _permit = tokio::select! {
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = cancel.cancelled() => {
                        tracing::warn!("Job dropped before it started");
                        return;
                    }
                };

                tracing::debug!("Job running");
                tokio::select! {
                    finished = tokio::time::timeout(timeout, job) => match finished {
                        Ok(()) => tracing::debug!("Job finished"),
                        Err(_) => {
                            tracing::error!(timeout_secs = timeout.as_secs(), "Job timed out")
                        }
                    },
                    _ = cancel.cancelled() => tracing::warn!("Job cancelled by shutdown"),
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Stop accepting jobs and wait up to `grace` for running ones.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        tracing::info!(active = self.tracker.len(), "Waiting for background jobs");
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(active = self.tracker.len(), "Grace period over, cancelling jobs");
            self.cancel.cancel();
            self.tracker.wait().await;
        }
    }
}
