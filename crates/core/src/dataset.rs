//! Focus data parsing, crop geometry and caption rules for training datasets.
//!
//! Focus data (`focus_data.json` for local training, `crop_data.json` for
//! hosted training) maps each image filename to a percentage crop box chosen
//! in the upload UI. Entries keep their document order so processed images
//! are numbered in the order the user arranged them.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

/// Caption gender used when the request carries anything but `man`/`woman`.
pub const FALLBACK_GENDER: &str = "person";

/// Maximum number of failed filenames quoted in a summary.
const FAILURE_SUMMARY_LIMIT: usize = 5;

// ---------------------------------------------------------------------------
// Focus data
// ---------------------------------------------------------------------------

/// Crop selection in percent of the source image.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CropInfo {
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "full_extent")]
    pub width: f64,
    #[serde(default = "full_extent")]
    pub height: f64,
}

fn full_extent() -> f64 {
    100.0
}

impl Default for CropInfo {
    fn default() -> Self {
        Self {
            unit: Some("%".to_string()),
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 100.0,
        }
    }
}

/// One `filename -> crop` entry of a focus data document.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusEntry {
    pub filename: String,
    pub crop: CropInfo,
}

/// A parsed focus data document, in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FocusData(pub Vec<FocusEntry>);

impl FocusData {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FocusEntry> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for FocusData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FocusVisitor;

        impl<'de> Visitor<'de> for FocusVisitor {
            type Value = FocusData;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping filenames to crop boxes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FocusData, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((filename, crop)) = map.next_entry::<String, CropInfo>()? {
                    entries.push(FocusEntry { filename, crop });
                }
                Ok(FocusData(entries))
            }
        }

        deserializer.deserialize_map(FocusVisitor)
    }
}

// ---------------------------------------------------------------------------
// Crop geometry
// ---------------------------------------------------------------------------

/// Pixel crop rectangle, `left`/`top` inclusive and `right`/`bottom` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropBox {
    /// Convert a percentage crop into pixels for an image of `(width, height)`.
    ///
    /// Edges are floored, then clamped to the image with `right >= left` and
    /// `bottom >= top`.
    pub fn from_percent(info: &CropInfo, (width, height): (u32, u32)) -> Self {
        let edge = |percent: f64, extent: u32| -> u32 {
            let px = (percent / 100.0 * f64::from(extent)).floor();
            if px.is_nan() || px <= 0.0 {
                0
            } else {
                (px as u64).min(u64::from(extent)) as u32
            }
        };

        let left = edge(info.x, width);
        let top = edge(info.y, height);
        let right = edge(info.x + info.width, width).max(left);
        let bottom = edge(info.y + info.height, height).max(top);

        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Largest square centered in an image of `(width, height)`.
    pub fn center_square(width: u32, height: u32) -> Self {
        let side = width.min(height);
        let left = (width - side) / 2;
        let top = (height - side) / 2;
        Self {
            left,
            top,
            right: left + side,
            bottom: top + side,
        }
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

// ---------------------------------------------------------------------------
// Captions and naming
// ---------------------------------------------------------------------------

/// Normalize the requested gender into a caption word.
pub fn caption_gender(gender: &str) -> &'static str {
    match gender.to_lowercase().as_str() {
        "man" => "man",
        "woman" => "woman",
        _ => FALLBACK_GENDER,
    }
}

/// Caption text written next to each processed image.
pub fn caption_text(trigger_word: &str, gender: &str) -> String {
    format!("{trigger_word} {}", caption_gender(gender))
}

/// File stem of the `index`-th processed image (1-based): `image_001`.
pub fn image_stem(index: usize) -> String {
    format!("image_{index:03}")
}

/// Log-friendly summary of failed items, quoting at most the first five.
pub fn failure_summary(failed: &[String]) -> String {
    let quoted = failed
        .iter()
        .take(FAILURE_SUMMARY_LIMIT)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let ellipsis = if failed.len() > FAILURE_SUMMARY_LIMIT {
        ", ..."
    } else {
        ""
    };
    format!("{} failed: [{quoted}{ellipsis}]", failed.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_data_keeps_document_order_and_defaults() {
        let json = br#"{
            "b/second.jpg": {"unit": "%", "x": 10, "y": 20.5, "width": 50, "height": 40},
            "a/first.png": {}
        }"#;
        let data = FocusData::from_slice(json).unwrap();

        let names: Vec<_> = data.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["b/second.jpg", "a/first.png"]);
        assert_eq!(data.0[0].crop.y, 20.5);

        let defaults = &data.0[1].crop;
        assert_eq!((defaults.x, defaults.y), (0.0, 0.0));
        assert_eq!((defaults.width, defaults.height), (100.0, 100.0));
    }

    #[test]
    fn focus_data_rejects_non_object() {
        assert!(FocusData::from_slice(b"[1, 2]").is_err());
        assert!(FocusData::from_slice(b"{not json").is_err());
    }

    #[test]
    fn crop_box_floors_percentages() {
        let info = CropInfo {
            x: 10.0,
            y: 25.0,
            width: 50.0,
            height: 50.0,
            ..CropInfo::default()
        };
        let crop = CropBox::from_percent(&info, (333, 200));
        assert_eq!(
            crop,
            CropBox {
                left: 33,
                top: 50,
                right: 199,
                bottom: 150
            }
        );
    }

    #[test]
    fn crop_box_is_clamped_to_image_bounds() {
        let info = CropInfo {
            x: -10.0,
            y: 90.0,
            width: 150.0,
            height: 50.0,
            ..CropInfo::default()
        };
        let crop = CropBox::from_percent(&info, (100, 100));
        assert_eq!(
            crop,
            CropBox {
                left: 0,
                top: 90,
                right: 100,
                bottom: 100
            }
        );
    }

    #[test]
    fn inverted_crop_collapses_to_empty() {
        let info = CropInfo {
            x: 50.0,
            width: -20.0,
            ..CropInfo::default()
        };
        let crop = CropBox::from_percent(&info, (100, 100));
        assert_eq!(crop.right, crop.left);
        assert!(crop.is_empty());
    }

    #[test]
    fn center_square_picks_largest_centered_square() {
        assert_eq!(
            CropBox::center_square(300, 200),
            CropBox {
                left: 50,
                top: 0,
                right: 250,
                bottom: 200
            }
        );
        assert_eq!(CropBox::center_square(101, 100).left, 0);
        assert_eq!(CropBox::center_square(80, 120).top, 20);
    }

    #[test]
    fn caption_gender_normalizes() {
        assert_eq!(caption_gender("Man"), "man");
        assert_eq!(caption_gender("WOMAN"), "woman");
        assert_eq!(caption_gender("nonbinary"), "person");
        assert_eq!(caption_gender(""), "person");
        assert_eq!(caption_text("ohwx", "Woman"), "ohwx woman");
    }

    #[test]
    fn image_stems_are_zero_padded() {
        assert_eq!(image_stem(1), "image_001");
        assert_eq!(image_stem(42), "image_042");
        assert_eq!(image_stem(1234), "image_1234");
    }

    #[test]
    fn failure_summary_quotes_first_five() {
        let failed: Vec<String> = (1..=7).map(|i| format!("f{i}.jpg")).collect();
        assert_eq!(
            failure_summary(&failed),
            "7 failed: [f1.jpg, f2.jpg, f3.jpg, f4.jpg, f5.jpg, ...]"
        );
        assert_eq!(failure_summary(&failed[..1]), "1 failed: [f1.jpg]");
    }
}
