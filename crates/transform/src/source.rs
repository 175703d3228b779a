//! Source asset fetching.
//!
//! Store locators read from the source [`ObjectStore`]; URL locators are
//! fetched over HTTP. 403 and 404 are expected outcomes (a client asked
//! for something that is not there) and log quietly; anything else is an
//! anomaly worth a warning.

use crate::error::{EngineResult, TransformError};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use prism_core::SourceLocator;
use prism_storage::{ByteStream, ObjectStore, StorageError};
use std::sync::Arc;
use std::time::Duration;

/// Reads source bytes for a [`SourceLocator`].
#[derive(Clone)]
pub struct SourceFetcher {
    objects: Arc<dyn ObjectStore>,
    client: reqwest::Client,
    max_bytes: u64,
}

impl SourceFetcher {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        timeout: Duration,
        max_bytes: u64,
    ) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("prism/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransformError::UpstreamUnavailable {
                locator: "http client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            objects,
            client,
            max_bytes,
        })
    }

    /// Fetch the whole source into memory.
    pub async fn fetch(&self, locator: &SourceLocator) -> EngineResult<Bytes> {
        let (length, mut stream) = self.open(locator).await?;
        let mut buf = BytesMut::with_capacity(length.unwrap_or(0).min(self.max_bytes) as usize);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| unavailable(locator, e))?;
            buf.extend_from_slice(&chunk);
            self.check_size(buf.len() as u64)?;
        }
        Ok(buf.freeze())
    }

    /// Open the source as a stream, with its length when known.
    ///
    /// The declared length is checked against the size limit up front; the
    /// stream itself is cut off once it passes the limit.
    pub async fn open(
        &self,
        locator: &SourceLocator,
    ) -> EngineResult<(Option<u64>, ByteStream)> {
        let (length, stream) = match locator {
            SourceLocator::Object { key } => self.open_object(locator, key).await?,
            SourceLocator::Url(url) => self.open_url(locator, url).await?,
        };
        if let Some(length) = length {
            self.check_size(length)?;
        }
        Ok((length, limit_stream(stream, self.max_bytes)))
    }

    async fn open_object(
        &self,
        locator: &SourceLocator,
        key: &str,
    ) -> EngineResult<(Option<u64>, ByteStream)> {
        let opened = async {
            let meta = self.objects.head(key).await?;
            let stream = self.objects.get_stream(key).await?;
            Ok::<_, StorageError>((Some(meta.size), stream))
        }
        .await;

        match opened {
            Ok(opened) => Ok(opened),
            Err(StorageError::NotFound(_)) => Err(upstream_status(locator, 404)),
            Err(e) => {
                tracing::warn!(locator = %locator, error = %e, "Source store read failed");
                Err(TransformError::Storage(e))
            }
        }
    }

    async fn open_url(
        &self,
        locator: &SourceLocator,
        url: &str,
    ) -> EngineResult<(Option<u64>, ByteStream)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable(locator, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream_status(locator, status.as_u16()));
        }

        let length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StorageError::Io(std::io::Error::other(e))));
        Ok((length, Box::pin(stream)))
    }

    fn check_size(&self, size: u64) -> EngineResult<()> {
        if self.max_bytes > 0 && size > self.max_bytes {
            return Err(TransformError::SourceTooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

fn upstream_status(locator: &SourceLocator, status: u16) -> TransformError {
    if matches!(status, 403 | 404) {
        tracing::debug!(locator = %locator, status, "Source not available");
    } else {
        tracing::warn!(locator = %locator, status, "Unexpected upstream status");
    }
    TransformError::UpstreamFetch {
        locator: locator.to_string(),
        status,
    }
}

fn unavailable(locator: &SourceLocator, err: impl std::fmt::Display) -> TransformError {
    tracing::warn!(locator = %locator, error = %err, "Source fetch failed");
    TransformError::UpstreamUnavailable {
        locator: locator.to_string(),
        message: err.to_string(),
    }
}

/// End the stream with an error once more than `max_bytes` have passed.
fn limit_stream(stream: ByteStream, max_bytes: u64) -> ByteStream {
    if max_bytes == 0 {
        return stream;
    }
    let mut seen = 0u64;
    Box::pin(stream.map(move |chunk| {
        let chunk = chunk?;
        seen += chunk.len() as u64;
        if seen > max_bytes {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "source exceeds the {max_bytes} byte limit"
            ))));
        }
        Ok(chunk)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use prism_storage::FilesystemBackend;
    use std::net::TcpListener;
    use tempfile::tempdir;

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    async fn fetcher(max_bytes: u64) -> (tempfile::TempDir, Arc<dyn ObjectStore>, SourceFetcher) {
        let dir = tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());
        let fetcher =
            SourceFetcher::new(objects.clone(), Duration::from_secs(5), max_bytes).unwrap();
        (dir, objects, fetcher)
    }

    #[tokio::test]
    async fn reads_objects_from_store() {
        let (_dir, objects, fetcher) = fetcher(0).await;
        objects
            .put("acme/photo.jpg", Bytes::from_static(b"jpeg"))
            .await
            .unwrap();

        let locator = SourceLocator::object("acme", "photo.jpg").unwrap();
        assert_eq!(fetcher.fetch(&locator).await.unwrap(), Bytes::from_static(b"jpeg"));
    }

    #[tokio::test]
    async fn missing_object_is_upstream_404() {
        let (_dir, _objects, fetcher) = fetcher(0).await;
        let locator = SourceLocator::object("acme", "missing.jpg").unwrap();

        let err = fetcher.fetch(&locator).await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(404));
    }

    #[tokio::test]
    async fn enforces_size_limit() {
        let (_dir, objects, fetcher) = fetcher(4).await;
        objects
            .put("acme/big.jpg", Bytes::from_static(b"too many bytes"))
            .await
            .unwrap();

        let locator = SourceLocator::object("acme", "big.jpg").unwrap();
        assert!(matches!(
            fetcher.fetch(&locator).await,
            Err(TransformError::SourceTooLarge { limit: 4, .. })
        ));
    }

    #[tokio::test]
    async fn fetches_over_http() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/acme/clip.mp4");
                then.status(200).body("video bytes");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/acme/secret.mp4");
                then.status(403);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/acme/broken.mp4");
                then.status(500);
            })
            .await;

        let (_dir, _objects, fetcher) = fetcher(0).await;
        let ok = SourceLocator::http(&server.base_url(), "acme", "clip.mp4").unwrap();
        assert_eq!(
            fetcher.fetch(&ok).await.unwrap(),
            Bytes::from_static(b"video bytes")
        );

        let forbidden = SourceLocator::http(&server.base_url(), "acme", "secret.mp4").unwrap();
        assert_eq!(
            fetcher.fetch(&forbidden).await.unwrap_err().upstream_status(),
            Some(403)
        );

        let broken = SourceLocator::http(&server.base_url(), "acme", "broken.mp4").unwrap();
        assert_eq!(
            fetcher.fetch(&broken).await.unwrap_err().upstream_status(),
            Some(500)
        );
    }
}
