//! Job description consumed by the external LoRA training toolkit.
//!
//! The toolkit reads a YAML document describing a single `sd_trainer`
//! process. Only the fields below are emitted; everything else falls back to
//! toolkit defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const BASE_MODEL: &str = "black-forest-labs/FLUX.1-dev";
pub const LORA_RANK: u32 = 32;
pub const LEARNING_RATE: f64 = 0.0001;
pub const CAPTION_DROPOUT_RATE: f64 = 0.05;
pub const TRAINING_RESOLUTIONS: [u32; 3] = [512, 768, 1024];

/// Inputs that vary per training job.
#[derive(Debug, Clone)]
pub struct TrainingConfigParams<'a> {
    pub user_id: &'a str,
    pub studio_id: &'a str,
    pub trigger_word: &'a str,
    pub steps: u32,
    pub dataset_dir: &'a Path,
    pub output_dir: &'a Path,
    pub model_cache_dir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub job: String,
    pub config: JobConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub process: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub training_folder: String,
    pub device: String,
    pub trigger_word: String,
    pub network: NetworkConfig,
    pub save: SaveConfig,
    pub skip_first_sample: bool,
    pub disable_sampling: bool,
    pub datasets: Vec<DatasetConfig>,
    pub train: TrainConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub linear: u32,
    pub linear_alpha: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveConfig {
    pub dtype: String,
    /// One past the final step so only the finished weights are written.
    pub save_every: u32,
    pub max_step_saves_to_keep: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub folder_path: String,
    pub caption_ext: String,
    pub caption_dropout_rate: f64,
    pub shuffle_tokens: bool,
    pub cache_latents_to_disk: bool,
    pub cache_latents: bool,
    pub resolution: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: u32,
    pub steps: u32,
    pub gradient_accumulation_steps: u32,
    pub train_unet: bool,
    pub train_text_encoder: bool,
    pub content_or_style: String,
    pub gradient_checkpointing: bool,
    pub noise_scheduler: String,
    pub optimizer: String,
    pub lr: f64,
    pub ema_config: EmaConfig,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaConfig {
    pub use_ema: bool,
    pub ema_decay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name_or_path: String,
    pub is_flux: bool,
    pub quantize: bool,
    pub cache_dir: String,
    pub local_files_only: bool,
}

impl TrainingConfig {
    pub fn build(params: &TrainingConfigParams<'_>) -> Self {
        let process = ProcessConfig {
            kind: "sd_trainer".into(),
            training_folder: path_string(params.output_dir),
            device: "cuda:0".into(),
            trigger_word: params.trigger_word.to_string(),
            network: NetworkConfig {
                kind: "lora".into(),
                linear: LORA_RANK,
                linear_alpha: LORA_RANK,
            },
            save: SaveConfig {
                dtype: "float16".into(),
                save_every: params.steps.saturating_add(1),
                max_step_saves_to_keep: 1,
            },
            skip_first_sample: true,
            disable_sampling: true,
            datasets: vec![DatasetConfig {
                folder_path: path_string(params.dataset_dir),
                caption_ext: "txt".into(),
                caption_dropout_rate: CAPTION_DROPOUT_RATE,
                shuffle_tokens: false,
                cache_latents_to_disk: false,
                cache_latents: true,
                resolution: TRAINING_RESOLUTIONS.to_vec(),
            }],
            train: TrainConfig {
                batch_size: 1,
                steps: params.steps,
                gradient_accumulation_steps: 1,
                train_unet: true,
                train_text_encoder: false,
                content_or_style: "balanced".into(),
                gradient_checkpointing: false,
                noise_scheduler: "flowmatch".into(),
                optimizer: "adamw".into(),
                lr: LEARNING_RATE,
                ema_config: EmaConfig {
                    use_ema: true,
                    ema_decay: 0.99,
                },
                dtype: "bf16".into(),
            },
            model: ModelConfig {
                name_or_path: BASE_MODEL.into(),
                is_flux: true,
                quantize: false,
                cache_dir: path_string(params.model_cache_dir),
                local_files_only: false,
            },
        };

        Self {
            job: "extension".into(),
            config: JobConfig {
                name: format!("flux_lora_{}_{}", params.user_id, params.studio_id),
                process: vec![process],
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// `<work_dir>/config_<studio_id>.yaml`
pub fn config_path(work_dir: &Path, studio_id: &str) -> PathBuf {
    work_dir.join(format!("config_{studio_id}.yaml"))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(dataset: &'a Path, output: &'a Path, cache: &'a Path) -> TrainingConfigParams<'a> {
        TrainingConfigParams {
            user_id: "user-1",
            studio_id: "studio-9",
            trigger_word: "ohwx",
            steps: 1200,
            dataset_dir: dataset,
            output_dir: output,
            model_cache_dir: cache,
        }
    }

    #[test]
    fn build_fills_job_specific_fields() {
        let config = TrainingConfig::build(&params(
            Path::new("/work/dataset_studio-9"),
            Path::new("/work/output_studio-9"),
            Path::new("/cache"),
        ));

        assert_eq!(config.job, "extension");
        assert_eq!(config.config.name, "flux_lora_user-1_studio-9");

        let process = &config.config.process[0];
        assert_eq!(process.training_folder, "/work/output_studio-9");
        assert_eq!(process.save.save_every, 1201);
        assert_eq!(process.train.steps, 1200);
        assert_eq!(process.datasets[0].folder_path, "/work/dataset_studio-9");
        assert_eq!(process.model.cache_dir, "/cache");
    }

    #[test]
    fn yaml_uses_toolkit_field_names() {
        let config = TrainingConfig::build(&params(
            Path::new("/d"),
            Path::new("/o"),
            Path::new("/c"),
        ));
        let yaml = config.to_yaml().unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        let process = &doc["config"]["process"][0];
        assert_eq!(process["type"].as_str(), Some("sd_trainer"));
        assert_eq!(process["network"]["type"].as_str(), Some("lora"));
        assert_eq!(process["network"]["linear"].as_u64(), Some(32));
        assert_eq!(process["train"]["lr"].as_f64(), Some(0.0001));
        assert_eq!(process["train"]["ema_config"]["use_ema"].as_bool(), Some(true));
        assert_eq!(process["model"]["name_or_path"].as_str(), Some(BASE_MODEL));
        assert_eq!(process["datasets"][0]["resolution"][2].as_u64(), Some(1024));
    }

    #[test]
    fn config_path_is_keyed_by_studio() {
        assert_eq!(
            config_path(Path::new("/tmp/work"), "abc"),
            PathBuf::from("/tmp/work/config_abc.yaml")
        );
    }
}
