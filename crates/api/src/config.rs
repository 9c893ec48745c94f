use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use studio_cloud::replicate::DEFAULT_API_BASE;
use studio_cloud::{R2Config, TrainingTarget};
use studio_comfyui::runner::DEFAULT_RUN_TIMEOUT;
use studio_pipeline::spawner::DEFAULT_MAX_CONCURRENT_JOBS;

/// Extra time a training job gets beyond the trainer's own timeout for
/// dataset preparation and the weights upload.
const TRAINING_JOB_MARGIN: Duration = Duration::from_secs(30 * 60);

/// Default bound for `/hosted-training`, which downloads and stores trained
/// weights inline. Must exceed the provider download timeout.
const HOSTED_REQUEST_TIMEOUT_SECS: u64 = 900;

/// Default concurrent training jobs. Each holds a GPU for hours.
const DEFAULT_MAX_TRAINING_JOBS: usize = 1;

/// Extra time a generation job gets beyond the render timeout.
const GENERATION_JOB_MARGIN: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has an invalid value '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Reads environment-style variables. Blank values count as unset.
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn or(&self, var: &str, default: &str) -> String {
        self.optional(var).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Timeout for `/hosted-training` in seconds (default: `900`).
    pub hosted_request_timeout_secs: u64,
    /// Grace period for background jobs on shutdown, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                    |
    /// |-------------------------------|----------------------------|
    /// | `HOST`                        | `0.0.0.0`                  |
    /// | `PORT`                        | `8000`                     |
    /// | `CORS_ORIGINS`                | `http://localhost:3000`    |
    /// | `REQUEST_TIMEOUT_SECS`        | `30`                       |
    /// | `HOSTED_REQUEST_TIMEOUT_SECS` | `900`                      |
    /// | `SHUTDOWN_TIMEOUT_SECS`       | `30`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(&Vars(env_var))
    }

    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Self, ConfigError> {
        let cors_origins = vars
            .or("CORS_ORIGINS", "http://localhost:3000")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host: vars.or("HOST", "0.0.0.0"),
            port: vars.parsed("PORT", 8000)?,
            cors_origins,
            request_timeout_secs: vars.parsed("REQUEST_TIMEOUT_SECS", 30)?,
            hosted_request_timeout_secs: vars
                .parsed("HOSTED_REQUEST_TIMEOUT_SECS", HOSTED_REQUEST_TIMEOUT_SECS)?,
            shutdown_timeout_secs: vars.parsed("SHUTDOWN_TIMEOUT_SECS", 30)?,
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// R2 credentials and the public output bucket.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// `R2_ENDPOINT`, for MinIO or another S3-compatible store.
    pub endpoint_override: Option<String>,
    /// Bucket generated headshots are written to (`R2_BUCKET_NAME`).
    pub output_bucket: String,
    /// Public URL prefix for the output bucket (`R2_PUBLIC_URL`).
    pub public_base_url: String,
}

impl StorageConfig {
    pub fn r2(&self) -> R2Config {
        R2Config {
            account_id: self.account_id.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            endpoint_override: self.endpoint_override.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComfyUIConfig {
    pub base_url: String,
    pub workflow_path: PathBuf,
    pub loras_dir: PathBuf,
    pub run_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub program: String,
    /// Resolved against `working_dir` when that is set.
    pub script: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub model_cache_dir: PathBuf,
    pub timeout: Duration,
}

/// Present only when `REPLICATE_API_TOKEN` is set.
#[derive(Debug, Clone)]
pub struct HostedTrainingConfig {
    pub api_token: String,
    pub api_base: String,
    pub target: TrainingTarget,
    /// Public URL of this service's `/hosted-training` route, used as the
    /// provider's completion webhook.
    pub callback_base: Option<String>,
    pub app_webhook_url: Option<String>,
}

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
    pub storage: StorageConfig,
    /// Shared secret for outbound webhook signatures and hosted callbacks.
    pub webhook_secret: Option<String>,
    pub comfyui: ComfyUIConfig,
    pub trainer: TrainerConfig,
    pub hosted: Option<HostedTrainingConfig>,
    /// Permits shared by job kinds without a pool of their own.
    pub max_concurrent_jobs: usize,
    pub max_training_jobs: usize,
    pub max_generation_jobs: usize,
}

impl AppConfig {
    /// Load the full configuration.
    ///
    /// | Env Var                      | Default                         |
    /// |------------------------------|---------------------------------|
    /// | `DATABASE_URL`               | required                        |
    /// | `R2_ACCOUNT_ID`              | required                        |
    /// | `R2_ACCESS_KEY_ID`           | required                        |
    /// | `R2_SECRET_ACCESS_KEY`       | required                        |
    /// | `R2_ENDPOINT`                | unset                           |
    /// | `R2_BUCKET_NAME`             | `headshots`                     |
    /// | `R2_PUBLIC_URL`              | required                        |
    /// | `WEBHOOK_SECRET`             | unset (payloads unsigned)       |
    /// | `COMFYUI_URL`                | `http://127.0.0.1:8188`         |
    /// | `COMFYUI_WORKFLOW_PATH`      | `workflows/headshot.json`       |
    /// | `COMFYUI_LORAS_DIR`          | `/comfyui/models/loras`         |
    /// | `COMFYUI_TIMEOUT_SECS`       | `1200`                          |
    /// | `TRAINER_PROGRAM`            | `python`                        |
    /// | `TRAINER_SCRIPT`             | `run.py`                        |
    /// | `TRAINER_WORKING_DIR`        | unset (inherit)                 |
    /// | `TRAINER_WORK_DIR`           | `/tmp/training`                 |
    /// | `MODEL_CACHE_DIR`            | `/cache`                        |
    /// | `TRAINER_TIMEOUT_SECS`       | `7200`                          |
    /// | `REPLICATE_API_TOKEN`        | unset (hosted training off)     |
    /// | `REPLICATE_API_BASE`         | `https://api.replicate.com/v1`  |
    /// | `REPLICATE_MODEL_OWNER`      | `ostris`                        |
    /// | `REPLICATE_MODEL_NAME`       | `flux-dev-lora-trainer`         |
    /// | `REPLICATE_MODEL_VERSION`    | required with a token           |
    /// | `REPLICATE_DESTINATION`      | required with a token           |
    /// | `HOSTED_CALLBACK_URL`        | unset (no provider webhook)     |
    /// | `APP_WEBHOOK_URL`            | unset                           |
    /// | `MAX_CONCURRENT_JOBS`        | `4`                             |
    /// | `MAX_TRAINING_JOBS`          | `1`                             |
    /// | `MAX_GENERATION_JOBS`        | `4`                             |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(&Vars(env_var))
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::load(&Vars(lookup))
    }

    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Self, ConfigError> {
        let server = ServerConfig::load(vars)?;

        let storage = StorageConfig {
            account_id: vars.required("R2_ACCOUNT_ID")?,
            access_key_id: vars.required("R2_ACCESS_KEY_ID")?,
            secret_access_key: vars.required("R2_SECRET_ACCESS_KEY")?,
            endpoint_override: vars.optional("R2_ENDPOINT"),
            output_bucket: vars.or("R2_BUCKET_NAME", "headshots"),
            public_base_url: vars.required("R2_PUBLIC_URL")?,
        };

        let comfyui = ComfyUIConfig {
            base_url: vars.or("COMFYUI_URL", "http://127.0.0.1:8188"),
            workflow_path: vars.or("COMFYUI_WORKFLOW_PATH", "workflows/headshot.json").into(),
            loras_dir: vars.or("COMFYUI_LORAS_DIR", "/comfyui/models/loras").into(),
            run_timeout: Duration::from_secs(
                vars.parsed("COMFYUI_TIMEOUT_SECS", DEFAULT_RUN_TIMEOUT.as_secs())?,
            ),
        };

        let trainer = TrainerConfig {
            program: vars.or("TRAINER_PROGRAM", "python"),
            script: vars.or("TRAINER_SCRIPT", "run.py").into(),
            working_dir: vars.optional("TRAINER_WORKING_DIR").map(PathBuf::from),
            work_dir: vars.or("TRAINER_WORK_DIR", "/tmp/training").into(),
            model_cache_dir: vars.or("MODEL_CACHE_DIR", "/cache").into(),
            timeout: Duration::from_secs(vars.parsed("TRAINER_TIMEOUT_SECS", 7200)?),
        };

        let hosted = match vars.optional("REPLICATE_API_TOKEN") {
            None => None,
            Some(api_token) => Some(HostedTrainingConfig {
                api_token,
                api_base: vars.or("REPLICATE_API_BASE", DEFAULT_API_BASE),
                target: TrainingTarget {
                    owner: vars.or("REPLICATE_MODEL_OWNER", "ostris"),
                    model: vars.or("REPLICATE_MODEL_NAME", "flux-dev-lora-trainer"),
                    version: vars.required("REPLICATE_MODEL_VERSION")?,
                    destination: vars.required("REPLICATE_DESTINATION")?,
                },
                callback_base: vars.optional("HOSTED_CALLBACK_URL"),
                app_webhook_url: vars.optional("APP_WEBHOOK_URL"),
            }),
        };

        Ok(Self {
            server,
            database_url: vars.required("DATABASE_URL")?,
            storage,
            webhook_secret: vars.optional("WEBHOOK_SECRET"),
            comfyui,
            trainer,
            hosted,
            max_concurrent_jobs: vars.parsed("MAX_CONCURRENT_JOBS", DEFAULT_MAX_CONCURRENT_JOBS)?,
            max_training_jobs: vars.parsed("MAX_TRAINING_JOBS", DEFAULT_MAX_TRAINING_JOBS)?,
            max_generation_jobs: vars
                .parsed("MAX_GENERATION_JOBS", DEFAULT_MAX_CONCURRENT_JOBS)?,
        })
    }

    /// Upper bound for a whole training job.
    pub fn training_job_timeout(&self) -> Duration {
        self.trainer.timeout + TRAINING_JOB_MARGIN
    }

    /// Upper bound for a whole generation job.
    pub fn generation_job_timeout(&self) -> Duration {
        self.comfyui.run_timeout + GENERATION_JOB_MARGIN
    }
}

fn env_var(var: &str) -> Option<String> {
    std::env::var(var).ok()
}
