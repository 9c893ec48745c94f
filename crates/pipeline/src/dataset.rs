//! Turn uploaded photos into training images.
//!
//! Everything here is synchronous and CPU-bound; jobs call it through
//! `tokio::task::spawn_blocking`.

use std::io::{Cursor, Write};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use studio_core::dataset::{CropBox, CropInfo};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

/// Side length of every training image.
pub const TARGET_SIZE: u32 = 1024;

/// JPEG quality for images fed to the local trainer.
const LOCAL_JPEG_QUALITY: u8 = 100;

/// JPEG quality for images packed for the hosted trainer.
pub const HOSTED_JPEG_QUALITY: u8 = 95;

/// Upper bound on images sent to the hosted trainer.
pub const HOSTED_MAX_IMAGES: usize = 30;

/// A processed image ready to be written next to its caption.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    /// `png` when the source was PNG, `jpg` otherwise.
    pub extension: &'static str,
}

/// Crop to the focus box, center-square, resize to [`TARGET_SIZE`].
///
/// PNG sources stay PNG; everything else becomes an RGB JPEG.
pub fn prepare_training_image(
    bytes: &[u8],
    crop: &CropInfo,
) -> Result<ProcessedImage, image::ImageError> {
    let source_format = image::guess_format(bytes).ok();
    let image = image::load_from_memory(bytes)?;

    let focused = crop_to(&image, CropBox::from_percent(crop, (image.width(), image.height())));
    let square = crop_to(
        &focused,
        CropBox::center_square(focused.width(), focused.height()),
    );
    let resized = square.resize_exact(TARGET_SIZE, TARGET_SIZE, FilterType::Lanczos3);

    if source_format == Some(ImageFormat::Png) {
        Ok(ProcessedImage {
            bytes: encode_png(&resized)?,
            extension: "png",
        })
    } else {
        Ok(ProcessedImage {
            bytes: encode_jpeg(&resized, LOCAL_JPEG_QUALITY)?,
            extension: "jpg",
        })
    }
}

/// Crop when crop info is present, then stretch to [`TARGET_SIZE`] and
/// encode as JPEG.
pub fn prepare_hosted_image(
    bytes: &[u8],
    crop: Option<&CropInfo>,
) -> Result<Vec<u8>, image::ImageError> {
    let mut image = image::load_from_memory(bytes)?;
    if let Some(crop) = crop {
        image = crop_to(&image, CropBox::from_percent(crop, (image.width(), image.height())));
    }
    let resized = image.resize_exact(TARGET_SIZE, TARGET_SIZE, FilterType::Lanczos3);
    encode_jpeg(&resized, HOSTED_JPEG_QUALITY)
}

/// Pack `(name, bytes)` entries into a deflated zip archive.
pub fn build_archive(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, zip::result::ZipError> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in entries {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// An empty box leaves the image untouched.
fn crop_to(image: &DynamicImage, area: CropBox) -> DynamicImage {
    if area.is_empty() {
        return image.clone();
    }
    image.crop_imm(area.left, area.top, area.width(), area.height())
}

pub(crate) fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(&rgb)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use image::{Rgb, RgbImage};

    use super::*;

    fn sample(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([180, 40, 40])));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn png_sources_stay_png_at_target_size() {
        let processed = prepare_training_image(&sample(ImageFormat::Png, 60, 40), &CropInfo::default()).unwrap();
        assert_eq!(processed.extension, "png");
        assert_eq!(image::guess_format(&processed.bytes).unwrap(), ImageFormat::Png);

        let decoded = image::load_from_memory(&processed.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (TARGET_SIZE, TARGET_SIZE));
    }

    #[test]
    fn other_sources_become_jpeg() {
        let crop: CropInfo =
            serde_json::from_str(r#"{"unit":"%","x":10,"y":10,"width":50,"height":80}"#).unwrap();
        let processed = prepare_training_image(&sample(ImageFormat::Jpeg, 80, 80), &crop).unwrap();
        assert_eq!(processed.extension, "jpg");
        assert_eq!(image::guess_format(&processed.bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn degenerate_crop_keeps_whole_image() {
        let crop: CropInfo =
            serde_json::from_str(r#"{"x":150,"y":0,"width":10,"height":10}"#).unwrap();
        let processed = prepare_training_image(&sample(ImageFormat::Png, 20, 20), &crop).unwrap();
        let decoded = image::load_from_memory(&processed.bytes).unwrap();
        assert_eq!(decoded.width(), TARGET_SIZE);
    }

    #[test]
    fn garbage_is_an_image_error() {
        assert!(prepare_training_image(b"not an image", &CropInfo::default()).is_err());
        assert!(prepare_hosted_image(b"nope", None).is_err());
    }

    #[test]
    fn hosted_images_are_jpeg_squares() {
        let jpeg = prepare_hosted_image(&sample(ImageFormat::Png, 30, 90), None).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        assert_eq!((decoded.width(), decoded.height()), (TARGET_SIZE, TARGET_SIZE));
    }

    #[test]
    fn archive_contains_entries_in_order() {
        let archive = build_archive(&[
            ("image_001.jpg".to_string(), vec![1, 2, 3]),
            ("image_001.txt".to_string(), b"ohwx woman".to_vec()),
        ])
        .unwrap();

        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        assert_eq!(zip.len(), 2);
        assert_eq!(zip.by_index(0).unwrap().name(), "image_001.jpg");
        let mut caption = String::new();
        zip.by_name("image_001.txt").unwrap().read_to_string(&mut caption).unwrap();
        assert_eq!(caption, "ohwx woman");
    }
}
