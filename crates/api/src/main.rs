use std::net::SocketAddr;
use std::sync::Arc;

use studio_cloud::{ObjectStore, ReplicateClient, S3Store};
use studio_comfyui::WorkflowRunner;
use studio_db::records::{JobRecords, PgJobRecords};
use studio_events::WebhookDelivery;
use studio_pipeline::generation::{GenerationJob, GenerationSettings};
use studio_pipeline::hosted::{HostedSettings, HostedTrainingService};
use studio_pipeline::lora_cache::LoraCache;
use studio_pipeline::spawner::{JobSpawner, GENERATION_JOBS, TRAINING_JOBS};
use studio_pipeline::trainer::ToolkitTrainer;
use studio_pipeline::training::{TrainingJob, TrainingSettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use studio_api::config::AppConfig;
use studio_api::router::build_app_router;
use studio_api::state::{AppState, JobTimeouts};

/// Database connections; jobs hold one only for single statements.
const DB_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "studio_api=debug,studio_pipeline=debug,tower_http=debug".into()
            }),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    // --- Configuration ---
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        hosted_training = config.hosted.is_some(),
        signed_webhooks = config.webhook_secret.is_some(),
        "Loaded configuration",
    );

    // --- Database ---
    let pool = studio_db::create_pool(&config.database_url, DB_MAX_CONNECTIONS)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    studio_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    let records: Arc<dyn JobRecords> = Arc::new(PgJobRecords::new(pool));

    // --- Object storage ---
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&config.storage.r2()).await);
    tracing::info!(endpoint = %config.storage.r2().endpoint(), "Object storage client created");

    // --- Outbound webhooks ---
    let webhooks = WebhookDelivery::new(config.webhook_secret.clone())
        .expect("Failed to build webhook client");

    // --- Jobs ---
    let trainer = ToolkitTrainer {
        program: config.trainer.program.clone(),
        script: config.trainer.script.clone(),
        working_dir: config.trainer.working_dir.clone(),
        timeout: config.trainer.timeout,
    };
    let training = Arc::new(TrainingJob {
        store: Arc::clone(&store),
        records: Arc::clone(&records),
        trainer: Arc::new(trainer),
        webhooks: webhooks.clone(),
        settings: TrainingSettings::new(
            config.trainer.work_dir.clone(),
            config.trainer.model_cache_dir.clone(),
        ),
    });

    let renderer = WorkflowRunner::new(&config.comfyui.base_url, config.comfyui.run_timeout);
    let generation = Arc::new(GenerationJob {
        store: Arc::clone(&store),
        records: Arc::clone(&records),
        renderer: Arc::new(renderer),
        lora_cache: LoraCache::new(config.comfyui.loras_dir.clone()),
        webhooks: webhooks.clone(),
        settings: GenerationSettings {
            workflow_path: config.comfyui.workflow_path.clone(),
            output_bucket: config.storage.output_bucket.clone(),
            public_base_url: config.storage.public_base_url.clone(),
        },
    });

    let hosted = config.hosted.as_ref().map(|hosted| {
        let provider = ReplicateClient::new(&hosted.api_base, hosted.api_token.clone())
            .expect("Failed to build hosted training client");
        Arc::new(HostedTrainingService {
            store: Arc::clone(&store),
            records: Arc::clone(&records),
            provider,
            webhooks: webhooks.clone(),
            settings: HostedSettings {
                target: hosted.target.clone(),
                callback_base: hosted.callback_base.clone(),
                shared_secret: config.webhook_secret.clone(),
                app_webhook_url: hosted.app_webhook_url.clone(),
            },
        })
    });

    let spawner = JobSpawner::new(config.max_concurrent_jobs)
        .with_pool(TRAINING_JOBS, config.max_training_jobs)
        .with_pool(GENERATION_JOBS, config.max_generation_jobs);
    tracing::info!(
        max_training = config.max_training_jobs,
        max_generation = config.max_generation_jobs,
        "Job spawner ready",
    );

    // --- App state ---
    let state = AppState {
        records,
        training,
        generation,
        hosted,
        spawner: spawner.clone(),
        timeouts: JobTimeouts {
            training: config.training_job_timeout(),
            generation: config.generation_job_timeout(),
        },
    };

    let app = build_app_router(state, &config.server);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.server.host.parse().expect("Invalid HOST address"),
        config.server.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, draining jobs");
    spawner.shutdown(config.server.shutdown_grace()).await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl-C, starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
