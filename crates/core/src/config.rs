//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// SECURITY: When enabled, ensure this endpoint is network-restricted
    /// to authorized Prometheus scraper IPs only at the infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Largest multipart body accepted on the upload route, in bytes.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_max_request_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// Object storage backend configuration.
///
/// This is the source asset store: transform requests read from it in
/// `store` source mode, completed uploads are published into it, and the
/// remote cache writes its entries into it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a bucket name".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            _ => Ok(()),
        }
    }
}

/// Where transform sources are read from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Read `{container}/{file}` from the configured object store.
    Store,
    /// Fetch `{base_url}/{container}/{file}` over HTTP.
    Http {
        /// Base URL, e.g. `http://assets.example.com`.
        base_url: String,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Store
    }
}

/// Transform result cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheConfig {
    /// Bounded cache on local disk with least-recently-used eviction.
    Local {
        /// Cache directory.
        path: PathBuf,
        /// Total byte budget.
        #[serde(default = "default_cache_max_bytes")]
        max_bytes: u64,
    },
    /// Entries kept in the object store, optionally fronted by a CDN.
    Remote {
        /// Public CDN origin serving the object store, e.g. `https://cdn.example.com`.
        /// Browser navigations are redirected here instead of streamed.
        cdn_url: Option<String>,
        /// Key prefix for cache entries.
        #[serde(default = "default_cache_prefix")]
        prefix: String,
    },
}

fn default_cache_max_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_cache_prefix() -> String {
    "_cache".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from("./data/cache"),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CacheConfig::Local { max_bytes, .. } if *max_bytes == 0 => {
                Err("local cache requires a non-zero max_bytes budget".to_string())
            }
            CacheConfig::Remote {
                cdn_url: Some(url), ..
            } if !(url.starts_with("http://") || url.starts_with("https://")) => Err(format!(
                "cache cdn_url must be an absolute http(s) URL: {url}"
            )),
            _ => Ok(()),
        }
    }
}

/// Transform engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Scratch directory for encode inputs and outputs.
    #[serde(default = "default_transform_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// ffmpeg executable.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Asset served while an encode is running. Empty body when unset.
    #[serde(default)]
    pub placeholder_path: Option<PathBuf>,
    /// Encoder output below this size counts as a failure.
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Video bitrate when `bv` is not given.
    #[serde(default = "default_video_bitrate")]
    pub default_video_bitrate: String,
    /// Audio bitrate when `ba` is not given.
    #[serde(default = "default_audio_bitrate")]
    pub default_audio_bitrate: String,
    /// Largest source accepted, in bytes.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,
    /// Upstream fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_transform_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("prism")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_min_output_bytes() -> u64 {
    crate::MIN_OUTPUT_BYTES
}

fn default_video_bitrate() -> String {
    "1000k".to_string()
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_max_source_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_transform_scratch_dir(),
            ffmpeg_path: default_ffmpeg_path(),
            placeholder_path: None,
            min_output_bytes: default_min_output_bytes(),
            default_video_bitrate: default_video_bitrate(),
            default_audio_bitrate: default_audio_bitrate(),
            max_source_bytes: default_max_source_bytes(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl TransformConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Flow upload configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Scratch directory for chunk files and assembled uploads.
    #[serde(default = "default_upload_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Largest accepted upload in bytes (0 = unbounded).
    #[serde(default)]
    pub max_file_size: u64,
    /// Copy assembled files into the object store at `{container}/{filename}`.
    #[serde(default = "default_publish")]
    pub publish: bool,
}

fn default_upload_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("prism-uploads")
}

fn default_publish() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_upload_scratch_dir(),
            max_file_size: 0,
            publish: default_publish(),
        }
    }
}

impl UploadConfig {
    /// The configured bound, if any.
    pub fn max_file_size(&self) -> Option<u64> {
        (self.max_file_size > 0).then_some(self.max_file_size)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Object storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Transform source configuration.
    #[serde(default)]
    pub source: SourceConfig,
    /// Result cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Transform engine configuration.
    #[serde(default)]
    pub transform: TransformConfig,
    /// Flow upload configuration.
    #[serde(default)]
    pub upload: UploadConfig,
}

impl AppConfig {
    /// Create a test configuration rooted in `root`.
    ///
    /// **For testing only.** Every directory lives under `root`, so a
    /// `tempfile::TempDir` gives each test an isolated server.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::Filesystem {
                path: root.join("storage"),
            },
            source: SourceConfig::Store,
            cache: CacheConfig::Local {
                path: root.join("cache"),
                max_bytes: 64 * 1024 * 1024,
            },
            transform: TransformConfig {
                scratch_dir: root.join("scratch"),
                ..TransformConfig::default()
            },
            upload: UploadConfig {
                scratch_dir: root.join("uploads"),
                ..UploadConfig::default()
            },
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.cache.validate()?;
        if let SourceConfig::Http { base_url } = &self.source
            && !(base_url.starts_with("http://") || base_url.starts_with("https://"))
        {
            return Err(format!(
                "source base_url must be an absolute http(s) URL: {base_url}"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Figment;
    use figment::providers::{Env, Format, Toml};

    #[test]
    fn test_server_config_defaults_metrics_enabled() {
        let config = ServerConfig::default();
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_transform_defaults() {
        let config = TransformConfig::default();
        assert_eq!(config.min_output_bytes, 1024);
        assert_eq!(config.default_video_bitrate, "1000k");
        assert_eq!(config.default_audio_bitrate, "128k");
    }

    #[test]
    fn test_storage_config_s3_roundtrip_without_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: Some("http://localhost:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("media".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };

        let json = serde_json::to_string(&config).unwrap();
        let decoded: StorageConfig = serde_json::from_str(&json).unwrap();
        assert!(decoded.validate().is_ok());
        assert!(matches!(
            decoded,
            StorageConfig::S3 {
                force_path_style: true,
                ..
            }
        ));
    }

    #[test]
    fn test_storage_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_config_validation() {
        let zero = CacheConfig::Local {
            path: PathBuf::from("/tmp/c"),
            max_bytes: 0,
        };
        assert!(zero.validate().is_err());

        let relative_cdn = CacheConfig::Remote {
            cdn_url: Some("cdn.example.com".to_string()),
            prefix: default_cache_prefix(),
        };
        assert!(relative_cdn.validate().is_err());
    }

    #[test]
    fn test_upload_max_file_size_zero_is_unbounded() {
        assert_eq!(UploadConfig::default().max_file_size(), None);
        let bounded = UploadConfig {
            max_file_size: 10,
            ..UploadConfig::default()
        };
        assert_eq!(bounded.max_file_size(), Some(10));
    }

    #[test]
    fn test_toml_and_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "server.toml",
                r#"
                [server]
                bind = "0.0.0.0:9000"

                [cache]
                type = "remote"
                cdn_url = "https://cdn.example.com"

                [source]
                mode = "http"
                base_url = "http://assets.example.com"
                "#,
            )?;
            jail.set_env("PRISM_UPLOAD__MAX_FILE_SIZE", "2048");

            let config: AppConfig = Figment::new()
                .merge(Toml::file("server.toml"))
                .merge(Env::prefixed("PRISM_").split("__"))
                .extract()?;

            assert_eq!(config.server.bind, "0.0.0.0:9000");
            assert_eq!(config.upload.max_file_size, 2048);
            assert!(matches!(
                config.cache,
                CacheConfig::Remote { ref prefix, .. } if prefix == "_cache"
            ));
            assert!(config.validate().is_ok());
            Ok(())
        });
    }
}
