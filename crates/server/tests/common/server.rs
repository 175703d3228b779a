//! Server test utilities.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use prism_core::config::AppConfig;
use prism_server::assembler::FlowAssembler;
use prism_server::{AppState, create_router};
use prism_transform::{
    AvConfig, AvEngine, EncodeCommand, EncodeRunner, EngineResult, Progress, SourceFetcher,
    TransformError, Transformer,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Bytes served while an encode runs.
pub const PLACEHOLDER: &[u8] = b"placeholder-frame";

/// Stands in for ffmpeg: writes a fixed-size output file.
///
/// While held, encodes park until released or killed.
#[allow(dead_code)]
pub struct FakeEncoder {
    output_len: usize,
    calls: AtomicUsize,
    killed: AtomicUsize,
    gate: watch::Sender<bool>,
}

#[allow(dead_code)]
impl FakeEncoder {
    pub fn new(output_len: usize) -> Self {
        Self {
            output_len,
            calls: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
            gate: watch::Sender::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.gate.send_replace(false);
    }

    /// Wait until `n` encodes have started.
    pub async fn wait_for_calls(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.calls() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {n} encodes, saw {}",
                self.calls()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl EncodeRunner for FakeEncoder {
    async fn run(
        &self,
        command: EncodeCommand,
        progress: watch::Sender<Progress>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let released = async { gate.wait_for(|held| !*held).await.is_ok() };
        tokio::select! {
            _ = cancel.cancelled() => {
                self.killed.fetch_add(1, Ordering::SeqCst);
                return Err(TransformError::Encode("encode killed".to_string()));
            }
            _ = released => {}
        }
        tokio::fs::write(&command.output, vec![0x42; self.output_len]).await?;
        progress.send_modify(|p| p.done = true);
        Ok(())
    }
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub encoder: Arc<FakeEncoder>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        prism_server::metrics::register_metrics();

        let storage = prism_storage::from_config(&config.storage)
            .await
            .expect("Failed to create storage backend");
        let cache = prism_storage::cache::from_config(&config.cache, storage.clone())
            .await
            .expect("Failed to create cache");

        let sources = SourceFetcher::new(
            storage.clone(),
            config.transform.fetch_timeout(),
            config.transform.max_source_bytes,
        )
        .expect("Failed to create source fetcher");
        let encoder = Arc::new(FakeEncoder::new(4096));
        let av = AvEngine::open(
            AvConfig::from(&config.transform),
            sources.clone(),
            encoder.clone(),
            Bytes::from_static(PLACEHOLDER),
        )
        .await
        .expect("Failed to open AV engine");
        let transformer = Transformer::new(sources, av);

        let uploads =
            FlowAssembler::open(&config.upload.scratch_dir, config.upload.max_file_size())
                .await
                .expect("Failed to open upload scratch");

        let state = AppState::new(config, storage, cache, transformer, uploads);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            encoder,
            _temp_dir: temp_dir,
        }
    }

    /// Store a source asset at `key`.
    pub async fn put_source(&self, key: &str, data: Bytes) {
        self.state
            .storage
            .put(key, data)
            .await
            .expect("Failed to store source");
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    /// Issue a GET on its own task, as an independent client would.
    pub fn spawn_get(&self, uri: &str) -> JoinHandle<Response<Body>> {
        let router = self.router.clone();
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        tokio::spawn(async move { router.oneshot(request).await.unwrap() })
    }

    /// Current Prometheus exposition text.
    pub async fn metrics_text(&self) -> String {
        String::from_utf8(body_bytes(self.get("/metrics").await).await.to_vec()).unwrap()
    }

    /// Repeat a GET until the result is served from cache.
    pub async fn get_cached(&self, uri: &str) -> Response<Body> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let response = self.get(uri).await;
            if response.headers()["x-cached-response"] == "true" {
                return response;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{uri} was never served from cache"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Collect a response body.
#[allow(dead_code)]
pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

/// Collect a JSON response body.
#[allow(dead_code)]
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
