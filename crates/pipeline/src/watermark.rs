//! Tiled text watermark for preview images.
//!
//! Text is drawn with a built-in 5x7 bitmap font scaled to the font size,
//! white at alpha 80, in rows spaced one text block plus 50px apart with
//! every other row shifted by half a tile.

use image::{DynamicImage, RgbImage};

use crate::dataset::encode_png;

pub const WATERMARK_TEXT: &str = "HEADSSHOT.COM";

/// Opacity of the white text, out of 255.
const ALPHA: u32 = 80;

/// Gap between tiles on both axes.
const TILE_GAP: i64 = 50;

const MIN_FONT_SIZE: u32 = 20;

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

/// Blank column between glyphs.
const GLYPH_SPACING: u32 = 1;

/// Watermark an encoded image and return it as PNG.
pub fn watermark(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let mut canvas = image::load_from_memory(bytes)?.to_rgb8();
    apply_watermark(&mut canvas, WATERMARK_TEXT);
    encode_png(&DynamicImage::ImageRgb8(canvas))
}

/// `max(20, min(width, height) / 25)`
pub fn font_size(width: u32, height: u32) -> u32 {
    (width.min(height) / 25).max(MIN_FONT_SIZE)
}

/// Pixel extent of `text` drawn at `scale`.
pub fn text_extent(text: &str, scale: u32) -> (u32, u32) {
    let chars = text.chars().count() as u32;
    if chars == 0 {
        return (0, 0);
    }
    let advance = (GLYPH_WIDTH + GLYPH_SPACING) * scale;
    (chars * advance - GLYPH_SPACING * scale, GLYPH_HEIGHT * scale)
}

pub fn apply_watermark(canvas: &mut RgbImage, text: &str) {
    let (width, height) = canvas.dimensions();
    let scale = (font_size(width, height) / GLYPH_HEIGHT).max(1);
    let (text_width, text_height) = text_extent(text, scale);

    let step_x = i64::from(text_width) + TILE_GAP;
    let step_y = i64::from(text_height) + TILE_GAP;

    let mut y = -step_y;
    while y < i64::from(height) + step_y {
        let offset = if y.div_euclid(step_y) % 2 != 0 { step_x / 2 } else { 0 };
        let mut x = -step_x;
        while x < i64::from(width) + step_x {
            draw_text(canvas, text, x + offset, y, scale);
            x += step_x;
        }
        y += step_y;
    }
}

fn draw_text(canvas: &mut RgbImage, text: &str, origin_x: i64, origin_y: i64, scale: u32) {
    let advance = i64::from((GLYPH_WIDTH + GLYPH_SPACING) * scale);
    for (index, ch) in text.chars().enumerate() {
        let glyph_x = origin_x + index as i64 * advance;
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                fill_block(
                    canvas,
                    glyph_x + i64::from(col * scale),
                    origin_y + row as i64 * i64::from(scale),
                    scale,
                );
            }
        }
    }
}

fn fill_block(canvas: &mut RgbImage, left: i64, top: i64, size: u32) {
    let (width, height) = canvas.dimensions();
    let x_range = left.max(0)..(left + i64::from(size)).min(i64::from(width));
    let y_range = top.max(0)..(top + i64::from(size)).min(i64::from(height));
    for y in y_range {
        for x in x_range.clone() {
            let pixel = canvas.get_pixel_mut(x as u32, y as u32);
            for channel in pixel.0.iter_mut() {
                *channel = blend_white(*channel);
            }
        }
    }
}

fn blend_white(channel: u8) -> u8 {
    let c = u32::from(channel);
    (c + (255 - c) * ALPHA / 255) as u8
}

/// Rows of a 5x7 glyph, most significant of the low five bits leftmost.
fn glyph(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        _ => [0; 7],
    }
}
