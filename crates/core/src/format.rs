//! Output format resolution and pipeline dispatch.

use crate::error::{Error, Result};
use crate::settings::Settings;
use std::fmt;

/// Which transform pipeline handles a format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Av,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Av => "av",
        }
    }
}

/// A concrete container/codec family the server can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaFormat {
    Jpeg,
    Png,
    Webp,
    Tiff,
    Bmp,
    Gif,
    Mp4,
    M4v,
    Webm,
    Ts,
    M3u8,
    Mp3,
    Aac,
    Weba,
}

/// Image pipeline formats.
const IMAGE_FORMATS: &[(&str, MediaFormat, &str)] = &[
    ("jpg", MediaFormat::Jpeg, "image/jpeg"),
    ("jpeg", MediaFormat::Jpeg, "image/jpeg"),
    ("png", MediaFormat::Png, "image/png"),
    ("gif", MediaFormat::Gif, "image/gif"),
    ("webp", MediaFormat::Webp, "image/webp"),
    ("tif", MediaFormat::Tiff, "image/tiff"),
    ("tiff", MediaFormat::Tiff, "image/tiff"),
    ("bmp", MediaFormat::Bmp, "image/bmp"),
];

/// Audio/video pipeline formats. Consulted before the image table, so a
/// format listed in both (gif) is produced by the encoder.
const AV_FORMATS: &[(&str, MediaFormat, &str)] = &[
    ("mp4", MediaFormat::Mp4, "video/mp4"),
    ("m4v", MediaFormat::M4v, "video/x-m4v"),
    ("webm", MediaFormat::Webm, "video/webm"),
    ("m3u8", MediaFormat::M3u8, "application/x-mpegURL"),
    ("ts", MediaFormat::Ts, "video/MP2T"),
    ("gif", MediaFormat::Gif, "image/gif"),
    ("mp3", MediaFormat::Mp3, "audio/mpeg"),
    ("aac", MediaFormat::Aac, "audio/aac"),
    ("weba", MediaFormat::Weba, "audio/weba"),
];

/// Source-only extensions: readable as inputs but never emitted.
const INPUT_ONLY_EXTENSIONS: &[&str] = &[
    "mov", "mkv", "avi", "wav", "flac", "ogg", "oga", "m4a", "heic", "avif", "svg",
];

/// Look up an extension in the dispatch tables.
pub fn lookup(ext: &str) -> Option<(MediaKind, MediaFormat, &'static str)> {
    AV_FORMATS
        .iter()
        .find(|(e, _, _)| *e == ext)
        .map(|(_, format, mime)| (MediaKind::Av, *format, *mime))
        .or_else(|| {
            IMAGE_FORMATS
                .iter()
                .find(|(e, _, _)| *e == ext)
                .map(|(_, format, mime)| (MediaKind::Image, *format, *mime))
        })
}

/// Whether an extension names a media file the server understands.
pub fn is_media_extension(ext: &str) -> bool {
    lookup(ext).is_some() || INPUT_ONLY_EXTENSIONS.contains(&ext)
}

/// Content type for an extension, falling back to `application/octet-stream`.
pub fn mime_for_extension(ext: &str) -> &'static str {
    lookup(&ext.to_lowercase())
        .map(|(_, _, mime)| mime)
        .unwrap_or("application/octet-stream")
}

/// The resolved output of a transform request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputFormat {
    extension: String,
    format: MediaFormat,
    kind: MediaKind,
    mime: &'static str,
}

impl OutputFormat {
    /// Resolve from the `f` directive, else the requested file's extension.
    pub fn resolve(settings: &Settings, requested_ext: Option<&str>) -> Result<Self> {
        let ext = settings
            .scalar("f")
            .or(requested_ext)
            .map(str::to_lowercase)
            .ok_or_else(|| Error::UnsupportedFormat("no output format".to_string()))?;
        Self::from_extension(&ext)
    }

    pub fn from_extension(ext: &str) -> Result<Self> {
        let ext = ext.trim_start_matches('.').to_lowercase();
        let (kind, format, mime) =
            lookup(&ext).ok_or_else(|| Error::UnsupportedFormat(ext.clone()))?;
        Ok(Self {
            extension: ext,
            format,
            kind,
            mime,
        })
    }

    /// Extension as requested (`jpeg` and `jpg` are kept distinct).
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn format(&self) -> MediaFormat {
        self.format
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn mime(&self) -> &'static str {
        self.mime
    }

    /// Whether the encoded output can carry an alpha channel.
    pub fn supports_alpha(&self) -> bool {
        matches!(
            self.format,
            MediaFormat::Png | MediaFormat::Webp | MediaFormat::Tiff | MediaFormat::Gif
        )
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.extension)
    }
}
