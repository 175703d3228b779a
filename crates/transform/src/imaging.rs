//! Image transform engine.
//!
//! Steps run in a fixed order: sharpen, blur, crop, resize, flatten,
//! encode. Decoding and encoding are CPU-bound, so [`transform`] moves the
//! whole pipeline onto the blocking pool.

use crate::error::{EngineResult, TransformError};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageFormat, ImageReader, Rgb, RgbImage};
use prism_core::options::{Compass, Gravity, ImageOptions, MAX_DIMENSION, Resize, Rgb as Colour};
use prism_core::{MediaFormat, OutputFormat};
use std::io::Cursor;

const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// Smart-crop windows tried along the overflowing axis.
const SMART_CROP_STEPS: u32 = 16;

/// Transform `source` off the async scheduler.
pub async fn transform(
    source: Bytes,
    options: ImageOptions,
    format: OutputFormat,
) -> EngineResult<Bytes> {
    tokio::task::spawn_blocking(move || render(&source, &options, &format).map(Bytes::from))
        .await
        .map_err(|e| TransformError::Encode(format!("image task failed: {e}")))?
}

/// Run the full pipeline synchronously.
pub fn render(source: &[u8], options: &ImageOptions, format: &OutputFormat) -> EngineResult<Vec<u8>> {
    let mut img = decode(source)?;

    if let Some(sharpen) = options.sharpen {
        // Flat/jagged amounts become the unsharp-mask threshold.
        let threshold = sharpen
            .flat
            .map_or(0, |flat| (flat * 10.0).round().max(0.0) as i32);
        img = img.unsharpen(sharpen.sigma, threshold);
    }

    if let Some(sigma) = options.blur {
        img = img.blur(sigma);
    }

    if let Some(crop) = options.crop {
        let (w, h) = img.dimensions();
        if let Some((x, y, cw, ch)) = crop.resolve(w, h) {
            img = img.crop_imm(x, y, cw, ch);
        }
    }

    if let Some(resize) = options.resize {
        img = apply_resize(img, &resize)?;
    }

    let flatten_onto = match options.background {
        Some(colour) => Some(colour),
        None if !format.supports_alpha() => Some(Colour::WHITE),
        None => None,
    };
    if let Some(colour) = flatten_onto
        && img.color().has_alpha()
    {
        img = DynamicImage::ImageRgb8(flatten(&img, colour));
    }

    encode(img, format, options.quality)
}

/// Decode with EXIF orientation applied.
fn decode(source: &[u8]) -> EngineResult<DynamicImage> {
    let decode_err = |e: &dyn std::fmt::Display| TransformError::Decode(e.to_string());

    let mut decoder = ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| decode_err(&e))?
        .into_decoder()
        .map_err(|e| decode_err(&e))?;
    let orientation = decoder.orientation().map_err(|e| decode_err(&e))?;
    let mut img = DynamicImage::from_decoder(decoder).map_err(|e| decode_err(&e))?;
    img.apply_orientation(orientation);
    Ok(img)
}

fn apply_resize(img: DynamicImage, resize: &Resize) -> EngineResult<DynamicImage> {
    let (src_w, src_h) = img.dimensions();
    let target_w = resize.width.map(|d| d.resolve(src_w).max(1));
    let target_h = resize.height.map(|d| d.resolve(src_h).max(1));
    let covers = resize.fills() || resize.crops_by_gravity();
    check_scaled_size(src_w, src_h, target_w, target_h, covers)?;

    Ok(match (target_w, target_h) {
        (Some(w), Some(h)) if resize.crops_by_gravity() => {
            let gravity = resize.gravity.unwrap_or(Gravity::Compass(Compass::Center));
            cover_and_crop(img, w, h, gravity)
        }
        (Some(w), Some(h)) if resize.fills() => img.resize_to_fill(w, h, RESIZE_FILTER),
        (Some(w), Some(h)) => img.resize(w, h, RESIZE_FILTER),
        (Some(w), None) => img.resize(w, u32::MAX, RESIZE_FILTER),
        (None, Some(h)) => img.resize(u32::MAX, h, RESIZE_FILTER),
        (None, None) => img,
    })
}

/// Reject resizes whose intermediate image would exceed [`MAX_DIMENSION`].
///
/// A single target side scales the other by the source aspect ratio, and
/// covering scales past the box, so either can run far beyond the request.
fn check_scaled_size(
    src_w: u32,
    src_h: u32,
    target_w: Option<u32>,
    target_h: Option<u32>,
    covers: bool,
) -> EngineResult<()> {
    let scale_w = target_w.map(|w| f64::from(w) / f64::from(src_w.max(1)));
    let scale_h = target_h.map(|h| f64::from(h) / f64::from(src_h.max(1)));
    let scale = match (scale_w, scale_h) {
        (Some(a), Some(b)) if covers => a.max(b),
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => return Ok(()),
    };

    let limit = f64::from(MAX_DIMENSION);
    let scaled_w = (f64::from(src_w) * scale).round();
    let scaled_h = (f64::from(src_h) * scale).round();
    if scaled_w > limit || scaled_h > limit {
        return Err(TransformError::Request(prism_core::Error::InvalidSettings(format!(
            "resize to {scaled_w}x{scaled_h} exceeds {MAX_DIMENSION} pixels per side"
        ))));
    }
    Ok(())
}

/// Scale to cover `w x h`, then cut the overflow according to `gravity`.
fn cover_and_crop(img: DynamicImage, w: u32, h: u32, gravity: Gravity) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    let scale = (w as f64 / src_w as f64).max(h as f64 / src_h as f64);
    let cover_w = ((src_w as f64 * scale).round() as u32).max(w);
    let cover_h = ((src_h as f64 * scale).round() as u32).max(h);
    let covered = if (cover_w, cover_h) == (src_w, src_h) {
        img
    } else {
        img.resize_exact(cover_w, cover_h, RESIZE_FILTER)
    };

    let (x, y) = match gravity {
        Gravity::Compass(compass) => compass_offset(compass, cover_w - w, cover_h - h),
        Gravity::Entropy => best_window(&covered, w, h, entropy_score),
        Gravity::Attention => best_window(&covered, w, h, attention_score),
    };
    covered.crop_imm(x, y, w, h)
}

fn compass_offset(compass: Compass, spare_x: u32, spare_y: u32) -> (u32, u32) {
    let (cx, cy) = (spare_x / 2, spare_y / 2);
    match compass {
        Compass::North => (cx, 0),
        Compass::NorthEast => (spare_x, 0),
        Compass::East => (spare_x, cy),
        Compass::SouthEast => (spare_x, spare_y),
        Compass::South => (cx, spare_y),
        Compass::SouthWest => (0, spare_y),
        Compass::West => (0, cy),
        Compass::NorthWest => (0, 0),
        Compass::Center => (cx, cy),
    }
}

/// Slide a `w x h` window along the overflowing axis and keep the best scoring one.
fn best_window(
    img: &DynamicImage,
    w: u32,
    h: u32,
    score: fn(&DynamicImage, u32, u32, u32, u32) -> f64,
) -> (u32, u32) {
    let (img_w, img_h) = img.dimensions();
    let (spare_x, spare_y) = (img_w - w, img_h - h);
    let spare = spare_x.max(spare_y);
    if spare == 0 {
        return (0, 0);
    }

    let step = (spare / SMART_CROP_STEPS).max(1);
    let mut best = (f64::MIN, (0, 0));
    let mut offset = 0;
    loop {
        let pos = if spare_x > 0 { (offset, 0) } else { (0, offset) };
        let s = score(img, pos.0, pos.1, w, h);
        if s > best.0 {
            best = (s, pos);
        }
        if offset == spare {
            break;
        }
        offset = (offset + step).min(spare);
    }
    best.1
}

/// Shannon entropy of the window's luminance histogram.
fn entropy_score(img: &DynamicImage, x: u32, y: u32, w: u32, h: u32) -> f64 {
    let luma = img.crop_imm(x, y, w, h).to_luma8();
    let mut histogram = [0u64; 256];
    for pixel in luma.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }
    let total = (w as f64) * (h as f64);
    histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Edge density plus colour saturation, a cheap stand-in for saliency.
fn attention_score(img: &DynamicImage, x: u32, y: u32, w: u32, h: u32) -> f64 {
    let window = img.crop_imm(x, y, w, h).to_rgb8();
    let mut total = 0f64;
    for (px, py, pixel) in window.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let max = r.max(g).max(b) as f64;
        let min = r.min(g).min(b) as f64;
        total += max - min;

        if px + 1 < w {
            total += luma_delta(pixel, window.get_pixel(px + 1, py));
        }
        if py + 1 < h {
            total += luma_delta(pixel, window.get_pixel(px, py + 1));
        }
    }
    total / (w as f64 * h as f64)
}

fn luma_delta(a: &Rgb<u8>, b: &Rgb<u8>) -> f64 {
    let luma = |p: &Rgb<u8>| 0.299 * p.0[0] as f64 + 0.587 * p.0[1] as f64 + 0.114 * p.0[2] as f64;
    (luma(a) - luma(b)).abs()
}

/// Composite onto an opaque background.
fn flatten(img: &DynamicImage, colour: Colour) -> RgbImage {
    let rgba = img.to_rgba8();
    let [br, bg, bb] = colour.0;
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let a = a as u16;
        let blend = |fg: u8, bg: u8| ((fg as u16 * a + bg as u16 * (255 - a) + 127) / 255) as u8;
        Rgb([blend(r, br), blend(g, bg), blend(b, bb)])
    })
}

fn encode(img: DynamicImage, format: &OutputFormat, quality: u8) -> EngineResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    let encode_err = |e: image::ImageError| TransformError::Encode(e.to_string());
    let has_alpha = img.color().has_alpha();
    let eight_bit = |img: DynamicImage| {
        if has_alpha {
            DynamicImage::ImageRgba8(img.to_rgba8())
        } else {
            DynamicImage::ImageRgb8(img.to_rgb8())
        }
    };

    match format.format() {
        MediaFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut out, quality);
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(encode_err)?;
        }
        MediaFormat::Png => img.write_to(&mut out, ImageFormat::Png).map_err(encode_err)?,
        MediaFormat::Webp => eight_bit(img)
            .write_to(&mut out, ImageFormat::WebP)
            .map_err(encode_err)?,
        MediaFormat::Tiff => eight_bit(img)
            .write_to(&mut out, ImageFormat::Tiff)
            .map_err(encode_err)?,
        MediaFormat::Bmp => eight_bit(img)
            .write_to(&mut out, ImageFormat::Bmp)
            .map_err(encode_err)?,
        other => {
            return Err(TransformError::Request(prism_core::Error::UnsupportedFormat(
                format!("{other:?} is not an image output"),
            )));
        }
    }
    Ok(out.into_inner())
}
