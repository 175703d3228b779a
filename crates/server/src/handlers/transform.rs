//! Transform endpoints.
//!
//! - `GET /{container}/transform/{options}/{file}[/{original}]`
//! - `GET /{container}/transform/{file}` (inline JSON settings only)
//! - `GET /{container}/proxy/transform/{*rest}`
//!
//! Inline JSON in the first query key takes precedence over path tokens.

use crate::delivery::Responder;
use crate::error::{ApiError, ApiResult};
use crate::metrics::{
    AV_JOBS_ACTIVE, AV_JOBS_KILLED, CACHE_LOOKUPS, CACHE_STORES, TRANSFORM_DURATION,
    record_transform,
};
use crate::singleflight::{Flight, FlightGuard, Join};
use crate::state::AppState;
use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::http::header::{ORIGIN, RANGE};
use axum::response::Response;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use prism_core::config::SourceConfig;
use prism_core::source::split_requested_file;
use prism_core::{CacheKey, Directives, Settings, SourceLocator};
use prism_storage::cache::{self, CacheStore, EntryInfo, FetchMode};
use prism_transform::{
    EncodeJob, KillOnDrop, PendingEncode, TransformRequest, TransformResult,
};
use std::sync::Arc;
use std::time::Instant;

/// GET /{container}/transform/{options}/{file}/{original}
pub async fn transform_with_original(
    State(state): State<AppState>,
    Path((container, options, file, original)): Path<(String, String, String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let started = Instant::now();
    let settings = directives(query.as_deref(), Some(&options))?.parse()?;
    let (file, ext) = split_requested_file(&file, Some(&original));
    let source = locate(&state.config.source, &container, &file)?;
    serve(state, container, source, settings, ext, &headers, started).await
}

/// GET /{container}/transform/{options}/{file}
pub async fn transform_with_options(
    State(state): State<AppState>,
    Path((container, options, file)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let started = Instant::now();
    let settings = directives(query.as_deref(), Some(&options))?.parse()?;
    let (file, ext) = split_requested_file(&file, None);
    let source = locate(&state.config.source, &container, &file)?;
    serve(state, container, source, settings, ext, &headers, started).await
}

/// GET /{container}/transform/{file}
pub async fn transform_inline(
    State(state): State<AppState>,
    Path((container, file)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let started = Instant::now();
    let settings = directives(query.as_deref(), None)?.parse()?;
    let (file, ext) = split_requested_file(&file, None);
    let source = locate(&state.config.source, &container, &file)?;
    serve(state, container, source, settings, ext, &headers, started).await
}

/// GET /{container}/proxy/transform/{*rest}
///
/// Without inline settings, the first segment of `rest` holds the option
/// tokens and the query string is forwarded upstream.
pub async fn transform_proxy(
    State(state): State<AppState>,
    Path((container, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let started = Instant::now();
    let (settings, target, upstream_query) = match query.as_deref().and_then(inline_directives) {
        Some(inline) => (inline.parse()?, rest.as_str(), None),
        None => {
            let (options, target) = rest
                .split_once('/')
                .ok_or_else(|| prism_core::Error::InvalidSource(rest.clone()))?;
            let settings = Directives::Tokens(options.to_string()).parse()?;
            (settings, target, query.as_deref())
        }
    };
    let ext = target
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase());
    let source = SourceLocator::proxy(target, upstream_query)?;
    serve(state, container, source, settings, ext, &headers, started).await
}

/// Inline JSON from the first query key.
fn inline_directives(query: &str) -> Option<Directives> {
    let first = query.split('&').next()?;
    let key = first.split_once('=').map_or(first, |(key, _)| key);
    let key = percent_decode_str(key).decode_utf8().ok()?;
    Directives::inline_from_query_key(&key)
}

fn directives(query: Option<&str>, tokens: Option<&str>) -> prism_core::Result<Directives> {
    if let Some(inline) = query.and_then(inline_directives) {
        return Ok(inline);
    }
    tokens
        .map(|tokens| Directives::Tokens(tokens.to_string()))
        .ok_or_else(|| {
            prism_core::Error::InvalidSettings(
                "expected option tokens or inline JSON settings".to_string(),
            )
        })
}

fn locate(config: &SourceConfig, container: &str, file: &str) -> prism_core::Result<SourceLocator> {
    match config {
        SourceConfig::Store => SourceLocator::object(container, file),
        SourceConfig::Http { base_url } => SourceLocator::http(base_url, container, file),
    }
}

async fn serve(
    state: AppState,
    container: String,
    source: SourceLocator,
    settings: Settings,
    ext: Option<String>,
    headers: &HeaderMap,
    started: Instant,
) -> ApiResult<Response> {
    let request = TransformRequest::new(source, settings, ext.as_deref())?;
    let kind = request.format.kind().as_str();
    let responder = Responder::new(container, request.format.mime(), started);
    let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
    let mode = if headers.contains_key(ORIGIN) {
        FetchMode::Inline
    } else {
        FetchMode::Navigation
    };

    let result = respond(&state, &request, &responder, mode, range).await;
    TRANSFORM_DURATION
        .with_label_values(&[kind])
        .observe(started.elapsed().as_secs_f64());
    match &result {
        Ok((_, outcome)) => record_transform(kind, outcome),
        Err(e) => {
            record_transform(kind, "error");
            tracing::debug!(key = %request.key, code = e.code(), "Transform request failed");
        }
    }
    result.map(|(response, _)| response)
}

async fn respond(
    state: &AppState,
    request: &TransformRequest,
    responder: &Responder,
    mode: FetchMode,
    range: Option<&str>,
) -> ApiResult<(Response, &'static str)> {
    let entry = cache::lookup(state.cache.as_ref(), &request.key, mode).await;
    if let Some(hit) = TransformResult::from_cache(entry) {
        CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
        tracing::debug!(key = %request.key, "Serving cached result");
        let response = match hit {
            TransformResult::Ready(data) => responder.bytes(data, true, range),
            TransformResult::Stream { stream, length } => {
                responder.stream(stream, length, true, range)
            }
            TransformResult::Redirect(location) => responder.redirect(&location),
            TransformResult::Pending(pending) => responder.placeholder(pending.placeholder, range),
        };
        return Ok((response, "hit"));
    }
    CACHE_LOOKUPS.with_label_values(&["miss"]).inc();

    let flight = loop {
        match state.flights.join(&request.key) {
            Join::Leader(guard) => break lead(state, request, responder.container(), guard).await?,
            Join::Follower(mut rx) => match rx.recv().await {
                Ok(Ok(flight)) => break flight,
                Ok(Err(shared)) => return Err(ApiError::Shared(shared)),
                // The leader went away without an outcome; take over.
                Err(_) => continue,
            },
        }
    };

    Ok(match flight {
        Flight::Ready(data) => (responder.bytes(data, false, range), "miss"),
        Flight::Placeholder(data) => (responder.placeholder(data, range), "placeholder"),
    })
}

/// Run the transform for everyone waiting on this key.
async fn lead(
    state: &AppState,
    request: &TransformRequest,
    container: &str,
    guard: FlightGuard,
) -> ApiResult<Flight> {
    let result = match state.transformer.run(request).await {
        Ok(result) => result,
        Err(e) => return Err(fail(guard, ApiError::from(e))),
    };

    match result {
        TransformResult::Ready(data) => {
            guard.complete(Ok(Flight::Ready(data.clone())));
            spawn_persist(state.cache.clone(), request, container, data.clone());
            Ok(Flight::Ready(data))
        }
        TransformResult::Pending(PendingEncode {
            placeholder,
            job: Some(job),
        }) if request.waits_for_encode() => {
            let active = ActiveEncode::track();
            let disconnect = DisconnectGuard(Some(job.handle.kill_on_drop()));
            let outcome = job.completion.await;
            disconnect.disarm();
            drop(active);
            match outcome {
                Ok(data) => {
                    guard.complete(Ok(Flight::Ready(data.clone())));
                    spawn_persist(state.cache.clone(), request, container, data.clone());
                    Ok(Flight::Ready(data))
                }
                Err(e) => {
                    tracing::debug!(key = %request.key, placeholder = placeholder.len(), "Awaited encode failed");
                    Err(fail(guard, ApiError::from(e)))
                }
            }
        }
        TransformResult::Pending(PendingEncode { placeholder, job }) => {
            guard.complete(Ok(Flight::Placeholder(placeholder.clone())));
            if let Some(job) = job {
                spawn_encode_watch(state.cache.clone(), request, container, job);
            }
            Ok(Flight::Placeholder(placeholder))
        }
        other => Err(fail(
            guard,
            ApiError::Internal(format!("unexpected transform result: {other:?}")),
        )),
    }
}

fn fail(guard: FlightGuard, error: ApiError) -> ApiError {
    let shared = Arc::new(error);
    guard.complete(Err(shared.clone()));
    ApiError::Shared(shared)
}

/// Kills an awaited encode when the request future is dropped.
struct DisconnectGuard(Option<KillOnDrop>);

impl DisconnectGuard {
    fn disarm(mut self) {
        if let Some(kill) = self.0.take() {
            kill.disarm();
        }
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.0.take().is_some() {
            AV_JOBS_KILLED.inc();
        }
    }
}

/// Counts an encode in `AV_JOBS_ACTIVE` while held.
struct ActiveEncode;

impl ActiveEncode {
    fn track() -> Self {
        AV_JOBS_ACTIVE.inc();
        Self
    }
}

impl Drop for ActiveEncode {
    fn drop(&mut self) {
        AV_JOBS_ACTIVE.dec();
    }
}

fn spawn_persist(
    cache: Arc<dyn CacheStore>,
    request: &TransformRequest,
    container: &str,
    data: Bytes,
) {
    let key = request.key.clone();
    let mime = request.format.mime();
    let container = container.to_string();
    tokio::spawn(async move {
        store(cache.as_ref(), &key, data, EntryInfo::new(mime, &container)).await;
    });
}

/// Persist the encode's output once it lands; the client already has the placeholder.
fn spawn_encode_watch(
    cache: Arc<dyn CacheStore>,
    request: &TransformRequest,
    container: &str,
    job: EncodeJob,
) {
    let key = request.key.clone();
    let mime = request.format.mime();
    let container = container.to_string();
    let active = ActiveEncode::track();
    tokio::spawn(async move {
        let outcome = job.completion.await;
        drop(active);
        match outcome {
            Ok(data) => store(cache.as_ref(), &key, data, EntryInfo::new(mime, &container)).await,
            Err(e) => tracing::warn!(key = %key, error = %e, "Encode failed, nothing cached"),
        }
    });
}

async fn store(cache: &dyn CacheStore, key: &CacheKey, data: Bytes, info: EntryInfo<'_>) {
    let stored = cache::persist(cache, key, data, info).await;
    CACHE_STORES
        .with_label_values(&[if stored { "stored" } else { "skipped" }])
        .inc();
}
