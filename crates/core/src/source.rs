//! Source asset locators.

use crate::error::{Error, Result};
use crate::format::is_media_extension;
use std::fmt;

/// Where a transform reads its source bytes from.
///
/// The rendered form (`Display`) is the locator half of the canonical
/// cache key, so it must be stable for a given asset.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceLocator {
    /// An object in the configured source store, keyed `{container}/{file}`.
    Object { key: String },
    /// An absolute HTTP(S) URL.
    Url(String),
}

impl SourceLocator {
    /// Locate `{container}/{file}` inside the source object store.
    pub fn object(container: &str, file: &str) -> Result<Self> {
        validate_segment(container)?;
        let file = file.trim_start_matches('/');
        if file.is_empty() || file.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(Error::InvalidSource(file.to_string()));
        }
        Ok(Self::Object {
            key: format!("{container}/{file}"),
        })
    }

    /// Locate `{container}/{file}` below an HTTP base URL.
    pub fn http(base_url: &str, container: &str, file: &str) -> Result<Self> {
        validate_segment(container)?;
        let file = file.trim_start_matches('/');
        if file.is_empty() {
            return Err(Error::InvalidSource(file.to_string()));
        }
        Ok(Self::Url(format!(
            "{}/{container}/{file}",
            base_url.trim_end_matches('/')
        )))
    }

    /// Proxy mode: `rest` is a scheme-less `host/path`, with an optional
    /// query string carried through to the upstream request.
    pub fn proxy(rest: &str, query: Option<&str>) -> Result<Self> {
        let rest = rest.trim_start_matches('/');
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() || !rest.contains('/') {
            return Err(Error::InvalidSource(rest.to_string()));
        }
        let url = match query.filter(|q| !q.is_empty()) {
            Some(q) => format!("http://{rest}?{q}"),
            None => format!("http://{rest}"),
        };
        Ok(Self::Url(url))
    }

    /// Lowercased extension of the source path, ignoring any query string.
    pub fn extension(&self) -> Option<String> {
        let path = match self {
            Self::Object { key } => key.as_str(),
            Self::Url(url) => url.split(['?', '#']).next().unwrap_or(url),
        };
        let file = path.rsplit('/').next()?;
        let (stem, ext) = file.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_lowercase())
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object { key } => write!(f, "store:{key}"),
            Self::Url(url) => f.write_str(url),
        }
    }
}

fn validate_segment(container: &str) -> Result<()> {
    if container.is_empty() || container.contains(['/', '\\']) || container == ".." {
        return Err(Error::InvalidSource(container.to_string()));
    }
    Ok(())
}

fn has_media_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && is_media_extension(&ext.to_lowercase()))
}

/// Split a requested file path into the source file and the output extension.
///
/// Supports the three addressing shapes clients use:
/// - `photo.jpg` reads `photo.jpg` and outputs `jpg`
/// - `photo.jpg.webp` reads `photo.jpg` and outputs `webp`
/// - `photo.jpg/holiday.webp` reads `photo.jpg` and outputs `webp`
pub fn split_requested_file(file: &str, original: Option<&str>) -> (String, Option<String>) {
    let source = match original {
        Some(_) => file.to_string(),
        None => match file.rsplit_once('.') {
            Some((head, _)) if has_media_extension(head) => head.to_string(),
            _ => file.to_string(),
        },
    };

    let last = original.unwrap_or(file);
    let ext = last
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty());

    (source, ext)
}
