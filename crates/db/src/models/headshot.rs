//! Generated headshot rows.

use serde::{Deserialize, Serialize};

/// Insert DTO for a generated headshot. Image columns hold object keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHeadshot {
    pub studio_id: String,
    /// Watermarked preview.
    pub preview: String,
    /// Full-resolution standard image.
    pub result: String,
    /// High-definition upscale, when the workflow produced one.
    pub hd: Option<String>,
    pub prompt: String,
}
