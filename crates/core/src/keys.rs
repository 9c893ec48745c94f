//! Object storage bucket names and key layout.

use std::fmt;

use uuid::Uuid;

/// Bucket holding uploaded training images and their crop data.
pub const DATASETS_BUCKET: &str = "datasets";

/// Bucket holding trained LoRA weights.
pub const WEIGHTS_BUCKET: &str = "weights";

pub const FOCUS_DATA_FILE: &str = "focus_data.json";
pub const CROP_DATA_FILE: &str = "crop_data.json";
pub const DATASET_ARCHIVE_FILE: &str = "datasets.zip";
pub const LORA_WEIGHTS_FILE: &str = "lora.safetensors";

// ---------------------------------------------------------------------------
// Dataset inputs
// ---------------------------------------------------------------------------

/// Strip trailing slashes from a dataset object key.
pub fn normalize_object_key(object_key: &str) -> &str {
    object_key.trim_end_matches('/')
}

/// `<object_key>/focus_data.json`
pub fn focus_data_key(object_key: &str) -> String {
    format!("{}/{FOCUS_DATA_FILE}", normalize_object_key(object_key))
}

/// Key of a dataset image listed in focus data.
///
/// Focus-data filenames already carry the second path segment of the object
/// key, so only the first segment is prepended.
pub fn dataset_image_key(object_key: &str, filename: &str) -> String {
    let normalized = normalize_object_key(object_key);
    let base = normalized.split('/').next().unwrap_or(normalized);
    format!("{base}/{filename}")
}

/// `<object_key>/crop_data.json`
pub fn crop_data_key(object_key: &str) -> String {
    format!("{}/{CROP_DATA_FILE}", normalize_object_key(object_key))
}

/// `<object_key>/<filename>` for hosted-training inputs.
pub fn hosted_image_key(object_key: &str, filename: &str) -> String {
    format!("{}/{filename}", normalize_object_key(object_key))
}

/// `<object_key>/datasets.zip`
pub fn dataset_archive_key(object_key: &str) -> String {
    format!("{}/{DATASET_ARCHIVE_FILE}", normalize_object_key(object_key))
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// `<studio_id>/lora.safetensors`, written by the local training job.
pub fn studio_weights_key(studio_id: &str) -> String {
    format!("{studio_id}/{LORA_WEIGHTS_FILE}")
}

/// `<user_id>/<studio_id>/lora.safetensors`, written after hosted training.
pub fn hosted_weights_key(user_id: &str, studio_id: &str) -> String {
    format!("{user_id}/{studio_id}/{LORA_WEIGHTS_FILE}")
}

// ---------------------------------------------------------------------------
// Generated images
// ---------------------------------------------------------------------------

/// Which of the three uploaded renditions a generated image is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    /// Watermarked copy of the standard image.
    Preview,
    Standard,
    Hd,
}

impl ImageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageRole::Preview => "preview",
            ImageRole::Standard => "standard",
            ImageRole::Hd => "hd",
        }
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<user>/<studio>/<request>` with surrounding slashes stripped from each part.
pub fn output_prefix(user_id: &str, studio_id: &str, request_id: &str) -> String {
    [user_id, studio_id, request_id]
        .iter()
        .map(|part| part.trim_matches('/'))
        .collect::<Vec<_>>()
        .join("/")
}

/// `<prefix>/<role>_<uuid>.png`
pub fn output_image_key(prefix: &str, role: ImageRole, id: Uuid) -> String {
    format!("{}/{role}_{id}.png", prefix.trim_matches('/'))
}

/// Guess a content type from a key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "json" => "application/json",
        "zip" => "application/zip",
        "yaml" | "yml" => "application/yaml",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}
