//! Typed transform options extracted from [`Settings`].
//!
//! Extraction happens before any I/O so malformed directives are rejected
//! up front. Directives that parse but fall below their useful threshold
//! (a sharpen sigma under 0.5, a blur sigma under 0.3) are ignored rather
//! than rejected.

use crate::error::{Error, Result};
use crate::settings::Settings;

/// Default encoder quality when `q` is absent.
pub const DEFAULT_QUALITY: u8 = 100;

/// Largest pixel length a directive may ask for, on either axis.
pub const MAX_DIMENSION: u32 = 16_384;

const MIN_SHARPEN_SIGMA: f32 = 0.5;
const MIN_BLUR_SIGMA: f32 = 0.3;

/// A length that is either absolute or relative to the source dimension.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Dimension {
    Pixels(u32),
    /// Fraction of the corresponding source dimension, in `(0, 1]`.
    Fraction(f64),
}

impl Dimension {
    fn parse(key: &str, raw: &str) -> Result<Self> {
        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|_| invalid(key, raw, "expected a number"))?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid(key, raw, "expected a non-negative number"));
        }
        if value <= 1.0 {
            Ok(Self::Fraction(value))
        } else if value.round() <= f64::from(MAX_DIMENSION) {
            Ok(Self::Pixels(value.round() as u32))
        } else {
            Err(invalid(
                key,
                raw,
                &format!("must not exceed {MAX_DIMENSION} pixels"),
            ))
        }
    }

    /// Resolve against a source dimension.
    pub fn resolve(self, total: u32) -> u32 {
        match self {
            Self::Pixels(px) => px,
            Self::Fraction(f) => (f * total as f64).round() as u32,
        }
    }
}

/// Crop box in source coordinates. Missing edges default to the image bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CropBox {
    pub x: Option<Dimension>,
    pub y: Option<Dimension>,
    pub x2: Option<Dimension>,
    pub y2: Option<Dimension>,
}

impl CropBox {
    /// Resolve to `(left, top, width, height)`, clamped to the source.
    pub fn resolve(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let left = self.x.map_or(0, |d| d.resolve(width)).min(width);
        let top = self.y.map_or(0, |d| d.resolve(height)).min(height);
        let right = self.x2.map_or(width, |d| d.resolve(width)).min(width);
        let bottom = self.y2.map_or(height, |d| d.resolve(height)).min(height);
        if right <= left || bottom <= top {
            return None;
        }
        Some((left, top, right - left, bottom - top))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScaleMode {
    /// Scale to fit within the box, preserving aspect ratio.
    #[default]
    Fit,
    /// Scale to cover the box, cropping the overflow.
    Fill,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compass {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
    Center,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gravity {
    Compass(Compass),
    /// Keep the window with the most luminance detail.
    Entropy,
    /// Keep the window with the strongest edges and saturation.
    Attention,
}

impl Gravity {
    fn parse(raw: &str) -> Result<Self> {
        let gravity = match raw.trim().to_lowercase().as_str() {
            "north" | "n" | "top" => Self::Compass(Compass::North),
            "northeast" | "ne" => Self::Compass(Compass::NorthEast),
            "east" | "e" | "right" => Self::Compass(Compass::East),
            "southeast" | "se" => Self::Compass(Compass::SouthEast),
            "south" | "s" | "bottom" => Self::Compass(Compass::South),
            "southwest" | "sw" => Self::Compass(Compass::SouthWest),
            "west" | "w" | "left" => Self::Compass(Compass::West),
            "northwest" | "nw" => Self::Compass(Compass::NorthWest),
            "center" | "centre" | "c" => Self::Compass(Compass::Center),
            "entropy" => Self::Entropy,
            "attention" => Self::Attention,
            _ => return Err(invalid("g", raw, "unknown gravity")),
        };
        Ok(gravity)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Resize {
    pub width: Option<Dimension>,
    pub height: Option<Dimension>,
    pub mode: ScaleMode,
    pub gravity: Option<Gravity>,
}

impl Resize {
    /// Cover scaling applies when asked for and no gravity takes over cropping.
    pub fn fills(&self) -> bool {
        self.mode == ScaleMode::Fill && self.gravity.is_none()
    }

    /// Both sides and a gravity: scale to cover, then crop by gravity.
    pub fn crops_by_gravity(&self) -> bool {
        self.width.is_some() && self.height.is_some() && self.gravity.is_some()
    }
}

/// Unsharp mask parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sharpen {
    pub sigma: f32,
    /// Gain for flat areas, when given.
    pub flat: Option<f32>,
    /// Gain for jagged areas, when given.
    pub jagged: Option<f32>,
}

impl Sharpen {
    fn parse(values: &[&str]) -> Result<Option<Self>> {
        let raw: Vec<&str> = values
            .iter()
            .flat_map(|v| v.split(':'))
            .filter(|v| !v.is_empty())
            .collect();

        match raw.as_slice() {
            [] => Ok(None),
            ["default"] => Ok(Some(Self {
                sigma: 1.0,
                flat: None,
                jagged: None,
            })),
            ["kirpan"] => Ok(Some(Self {
                sigma: 1.0,
                flat: Some(0.4),
                jagged: Some(0.6),
            })),
            [sigma] => {
                let sigma = parse_f32("sh", sigma)?;
                Ok((sigma >= MIN_SHARPEN_SIGMA).then_some(Self {
                    sigma,
                    flat: None,
                    jagged: None,
                }))
            }
            [sigma, flat] => Ok(Some(Self {
                sigma: parse_f32("sh", sigma)?,
                flat: Some(parse_f32("sh", flat)?),
                jagged: None,
            })),
            [sigma, flat, jagged] => Ok(Some(Self {
                sigma: parse_f32("sh", sigma)?,
                flat: Some(parse_f32("sh", flat)?),
                jagged: Some(parse_f32("sh", jagged)?),
            })),
            _ => Err(invalid("sh", &raw.join(":"), "expected at most three values")),
        }
    }
}

/// An opaque RGB colour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const WHITE: Self = Self([255, 255, 255]);

    /// Parse `#rgb`, `#rrggbb` (hash optional) or a basic colour name.
    pub fn parse(raw: &str) -> Result<Self> {
        let value = raw.trim().to_lowercase();
        match value.as_str() {
            "white" => return Ok(Self::WHITE),
            "black" => return Ok(Self([0, 0, 0])),
            "red" => return Ok(Self([255, 0, 0])),
            "green" => return Ok(Self([0, 128, 0])),
            "blue" => return Ok(Self([0, 0, 255])),
            "gray" | "grey" => return Ok(Self([128, 128, 128])),
            _ => {}
        }

        let hex = value.trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("b", raw, "expected a hex colour"));
        }
        let expanded: String = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect(),
            6 => hex.to_string(),
            _ => return Err(invalid("b", raw, "expected a hex colour")),
        };
        let channel = |i: usize| {
            u8::from_str_radix(&expanded[i..i + 2], 16)
                .map_err(|_| invalid("b", raw, "expected a hex colour"))
        };
        Ok(Self([channel(0)?, channel(2)?, channel(4)?]))
    }
}

/// Everything the image engine needs for one request.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageOptions {
    pub quality: u8,
    pub sharpen: Option<Sharpen>,
    pub blur: Option<f32>,
    pub crop: Option<CropBox>,
    pub resize: Option<Resize>,
    pub background: Option<Rgb>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            sharpen: None,
            blur: None,
            crop: None,
            resize: None,
            background: None,
        }
    }
}

impl ImageOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let quality = match settings.scalar("q") {
            Some(raw) => {
                let q: u8 = raw
                    .trim()
                    .parse()
                    .map_err(|_| invalid("q", raw, "expected an integer 1-100"))?;
                if !(1..=100).contains(&q) {
                    return Err(invalid("q", raw, "expected an integer 1-100"));
                }
                q
            }
            None => DEFAULT_QUALITY,
        };

        let sharpen = match settings.get("sh") {
            Some(value) => Sharpen::parse(&value.values())?,
            None => None,
        };

        let blur = match settings.scalar("bl") {
            Some(raw) => {
                let sigma = parse_f32("bl", raw)?;
                (sigma >= MIN_BLUR_SIGMA).then_some(sigma)
            }
            None => None,
        };

        let crop_edge = |key: &str| {
            settings
                .scalar(key)
                .map(|raw| Dimension::parse(key, raw))
                .transpose()
        };
        let crop = CropBox {
            x: crop_edge("x")?,
            y: crop_edge("y")?,
            x2: crop_edge("x2")?,
            y2: crop_edge("y2")?,
        };
        let crop = (crop.x.is_some() || crop.y.is_some() || crop.x2.is_some() || crop.y2.is_some())
            .then_some(crop);

        let width = optional_dimension(settings, "w")?;
        let height = optional_dimension(settings, "h")?;
        let gravity = settings.scalar("g").map(Gravity::parse).transpose()?;
        let mode = match settings.scalar("sm").map(str::to_lowercase).as_deref() {
            Some(m) if m.contains("fill") || m.contains("cover") => ScaleMode::Fill,
            _ => ScaleMode::Fit,
        };
        let resize = (width.is_some() || height.is_some()).then_some(Resize {
            width,
            height,
            mode,
            gravity,
        });

        let background = settings.scalar("b").map(Rgb::parse).transpose()?;

        Ok(Self {
            quality,
            sharpen,
            blur,
            crop,
            resize,
            background,
        })
    }
}

/// Bitrate override for one track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Bitrate {
    /// `0`: leave the track out of the output.
    Drop,
    /// An encoder bitrate such as `800k` or `2M`.
    Rate(String),
}

impl Bitrate {
    fn parse(key: &str, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw == "0" {
            return Ok(Self::Drop);
        }
        let digits = raw.trim_end_matches(['k', 'K', 'm', 'M']);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(invalid(key, raw, "expected a bitrate like 800k"));
        }
        Ok(Self::Rate(raw.to_string()))
    }
}

/// Everything the audio/video engine needs for one request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AvOptions {
    pub seek: Option<String>,
    pub duration: Option<String>,
    pub video_bitrate: Option<Bitrate>,
    pub audio_bitrate: Option<Bitrate>,
    pub audio_filters: Vec<String>,
    pub width: Option<Dimension>,
    pub height: Option<Dimension>,
    /// Wait for the encode instead of serving the placeholder (`ph_0`).
    pub wait: bool,
}

impl AvOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let seek = settings.scalar("s").map(|raw| timestamp("s", raw)).transpose()?;
        let duration = settings.scalar("d").map(|raw| timestamp("d", raw)).transpose()?;
        let video_bitrate = settings
            .scalar("bv")
            .map(|raw| Bitrate::parse("bv", raw))
            .transpose()?;
        let audio_bitrate = settings
            .scalar("ba")
            .map(|raw| Bitrate::parse("ba", raw))
            .transpose()?;
        let audio_filters = settings
            .get("fa")
            .map(|v| {
                v.values()
                    .into_iter()
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let wait = matches!(settings.scalar("ph"), Some("0" | "false" | "no"));

        Ok(Self {
            seek,
            duration,
            video_bitrate,
            audio_bitrate,
            audio_filters,
            width: optional_dimension(settings, "w")?,
            height: optional_dimension(settings, "h")?,
            wait,
        })
    }
}

fn optional_dimension(settings: &Settings, key: &str) -> Result<Option<Dimension>> {
    match settings.scalar(key) {
        Some(raw) => {
            let dim = Dimension::parse(key, raw)?;
            if dim == Dimension::Fraction(0.0) {
                return Err(invalid(key, raw, "must be greater than zero"));
            }
            Ok(Some(dim))
        }
        None => Ok(None),
    }
}

/// Seconds (`12.5`) or a clock value (`00:01:02.5`).
fn timestamp(key: &str, raw: &str) -> Result<String> {
    let raw = raw.trim();
    let valid = !raw.is_empty()
        && raw.split(':').count() <= 3
        && raw
            .split(':')
            .all(|part| !part.is_empty() && part.parse::<f64>().is_ok_and(|v| v >= 0.0));
    if !valid {
        return Err(invalid(key, raw, "expected seconds or hh:mm:ss"));
    }
    Ok(raw.to_string())
}

fn parse_f32(key: &str, raw: &str) -> Result<f32> {
    raw.trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| invalid(key, raw, "expected a non-negative number"))
}

fn invalid(key: &str, raw: &str, reason: &str) -> Error {
    Error::InvalidSettings(format!("{key}={raw}: {reason}"))
}
