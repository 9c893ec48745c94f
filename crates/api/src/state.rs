use std::sync::Arc;
use std::time::Duration;

use studio_db::records::JobRecords;
use studio_pipeline::generation::GenerationJob;
use studio_pipeline::hosted::HostedTrainingService;
use studio_pipeline::spawner::JobSpawner;
use studio_pipeline::training::TrainingJob;

/// Upper bounds for detached jobs, enforced by the spawner.
#[derive(Debug, Clone, Copy)]
pub struct JobTimeouts {
    pub training: Duration,
    pub generation: Duration,
}

/// Shared application state available to all handlers via axum's `State` extractor.
///
/// Must be `Clone` because axum clones it into each handler invocation.
/// All inner fields use `Arc` for cheap cloning.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn JobRecords>,
    pub training: Arc<TrainingJob>,
    pub generation: Arc<GenerationJob>,
    /// `None` when hosted training is not configured.
    pub hosted: Option<Arc<HostedTrainingService>>,
    pub spawner: JobSpawner,
    pub timeouts: JobTimeouts,
}
