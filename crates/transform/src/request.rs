//! A validated transform request.

use crate::av::codecs_for;
use prism_core::{
    AvOptions, CacheKey, ImageOptions, MediaKind, OutputFormat, Settings, SourceLocator,
};

/// Typed options for the pipeline that will run.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformPlan {
    Image(ImageOptions),
    Av(AvOptions),
}

/// Everything known about a request before any I/O happens.
#[derive(Clone, Debug)]
pub struct TransformRequest {
    pub source: SourceLocator,
    pub settings: Settings,
    pub format: OutputFormat,
    pub key: CacheKey,
    pub plan: TransformPlan,
}

impl TransformRequest {
    /// Resolve the output format, derive the cache key, and validate the
    /// directives for the chosen pipeline.
    pub fn new(
        source: SourceLocator,
        settings: Settings,
        requested_ext: Option<&str>,
    ) -> prism_core::Result<Self> {
        let format = OutputFormat::resolve(&settings, requested_ext)?;
        let plan = match format.kind() {
            MediaKind::Image => TransformPlan::Image(ImageOptions::from_settings(&settings)?),
            MediaKind::Av => {
                codecs_for(format.format())?;
                TransformPlan::Av(AvOptions::from_settings(&settings)?)
            }
        };
        let key = CacheKey::derive(&source, &settings, &format);
        Ok(Self {
            source,
            settings,
            format,
            key,
            plan,
        })
    }

    /// Whether the client asked to wait for the encode (`ph_0`).
    pub fn waits_for_encode(&self) -> bool {
        matches!(&self.plan, TransformPlan::Av(options) if options.wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{Directives, Error};

    fn request(tokens: &str, file: &str, ext: Option<&str>) -> prism_core::Result<TransformRequest> {
        let settings = Directives::Tokens(tokens.to_string()).parse()?;
        TransformRequest::new(SourceLocator::object("acme", file)?, settings, ext)
    }

    #[test]
    fn image_request_from_tokens() {
        let req = request("w_200,h_100,g_north,f_webp", "photo.jpg", Some("jpg")).unwrap();
        assert_eq!(req.format.extension(), "webp");
        assert!(matches!(req.plan, TransformPlan::Image(_)));
        assert!(req.key.to_string().ends_with(".webp"));
        assert!(!req.waits_for_encode());
    }

    #[test]
    fn gif_goes_to_the_encoder() {
        let req = request("w_200", "clip.mp4", Some("gif")).unwrap();
        assert!(matches!(req.plan, TransformPlan::Av(_)));
    }

    #[test]
    fn wait_flag() {
        let req = request("w_200,ph_0", "clip.mov", Some("mp4")).unwrap();
        assert!(req.waits_for_encode());
    }

    #[test]
    fn rejects_before_io() {
        assert!(matches!(
            request("w_200", "clip.mp4", Some("m3u8")),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            request("w_200", "photo.jpg", Some("exe")),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            request("q_500", "photo.jpg", Some("jpg")),
            Err(Error::InvalidSettings(_))
        ));
    }

    #[test]
    fn same_settings_same_key() {
        let a = request("w_200,h_100", "photo.jpg", Some("jpg")).unwrap();
        let b = request("h_100;w:200", "photo.jpg", Some("jpg")).unwrap();
        assert_eq!(a.key, b.key);
    }
}
