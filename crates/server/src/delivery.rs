//! Writes transform results to the client.
//!
//! Every byte-bearing response honors a single `Range: bytes=` request,
//! placeholders included. A whole placeholder goes out as 202 with no-cache
//! headers, since the asset it stands in for is still being encoded.

use axum::body::Body;
use axum::http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, EXPIRES,
    LAST_MODIFIED, LOCATION, PRAGMA,
};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use prism_storage::ByteStream;
use std::time::Instant;

const CACHE_TAG: HeaderName = HeaderName::from_static("cache-tag");
const X_TIME_ELAPSED: HeaderName = HeaderName::from_static("x-time-elapsed");
const X_CACHED_RESPONSE: HeaderName = HeaderName::from_static("x-cached-response");

/// Transform results are immutable for a given URL, so they never "change".
const EPOCH: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// A parsed `Range` header against a payload of known length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeRequest {
    Full,
    /// Inclusive byte bounds.
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a `Range` header.
///
/// Only single ranges are honored; multiple ranges and malformed headers
/// fall back to the full payload.
pub fn parse_range(header: Option<&str>, len: u64) -> RangeRequest {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return RangeRequest::Full;
    };
    if spec.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return RangeRequest::Full;
    };

    let (start, end) = match (start.trim(), end.trim()) {
        ("", "") => return RangeRequest::Full,
        // Suffix: the last n bytes.
        ("", suffix) => {
            let Ok(n) = suffix.parse::<u64>() else {
                return RangeRequest::Full;
            };
            if n == 0 || len == 0 {
                return RangeRequest::Unsatisfiable;
            }
            (len.saturating_sub(n), len - 1)
        }
        (start, "") => {
            let Ok(start) = start.parse::<u64>() else {
                return RangeRequest::Full;
            };
            (start, len.saturating_sub(1))
        }
        (start, end) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return RangeRequest::Full;
            };
            if end < start {
                return RangeRequest::Full;
            }
            (start, end.min(len.saturating_sub(1)))
        }
    };

    if start >= len {
        return RangeRequest::Unsatisfiable;
    }
    RangeRequest::Partial { start, end }
}

/// Builds transform responses for one request.
#[derive(Clone, Debug)]
pub struct Responder {
    container: String,
    content_type: &'static str,
    started: Instant,
}

impl Responder {
    pub fn new(container: impl Into<String>, content_type: &'static str, started: Instant) -> Self {
        Self {
            container: container.into(),
            content_type,
            started,
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    fn headers(&self, mut response: Response, cached: bool) -> Response {
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        if let Ok(tag) = HeaderValue::from_str(&self.container) {
            headers.insert(CACHE_TAG, tag);
        }
        let elapsed = format!("{}ms", self.started.elapsed().as_millis());
        if let Ok(elapsed) = HeaderValue::from_str(&elapsed) {
            headers.insert(X_TIME_ELAPSED, elapsed);
        }
        headers.insert(
            X_CACHED_RESPONSE,
            HeaderValue::from_static(if cached { "true" } else { "false" }),
        );
        headers.insert(LAST_MODIFIED, HeaderValue::from_static(EPOCH));
        response
    }

    /// Serve a complete buffer.
    pub fn bytes(&self, data: Bytes, cached: bool, range: Option<&str>) -> Response {
        self.headers(seekable(data, range), cached)
    }

    /// Pipe a stream of known length.
    pub fn stream(&self, stream: ByteStream, length: u64, cached: bool, range: Option<&str>) -> Response {
        let response = match parse_range(range, length) {
            RangeRequest::Full => full(Body::from_stream(stream), length),
            RangeRequest::Partial { start, end } => partial(
                Body::from_stream(slice_stream(stream, start, end)),
                start,
                end,
                length,
            ),
            RangeRequest::Unsatisfiable => unsatisfiable(length),
        };
        self.headers(response, cached)
    }

    /// Serve the stand-in asset while an encode runs.
    pub fn placeholder(&self, data: Bytes, range: Option<&str>) -> Response {
        let mut response = seekable(data, range);
        if response.status() == StatusCode::OK {
            *response.status_mut() = StatusCode::ACCEPTED;
        }
        let headers = response.headers_mut();
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("private, no-cache, no-store, must-revalidate"),
        );
        headers.insert(EXPIRES, HeaderValue::from_static("-1"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        self.headers(response, false)
    }

    /// Point the client at the CDN copy.
    pub fn redirect(&self, location: &str) -> Response {
        let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
        if let Ok(location) = HeaderValue::from_str(location) {
            response.headers_mut().insert(LOCATION, location);
        }
        self.headers(response, true)
    }
}

/// A buffer answered in full, in part, or with 416.
fn seekable(data: Bytes, range: Option<&str>) -> Response {
    let len = data.len() as u64;
    match parse_range(range, len) {
        RangeRequest::Full => full(Body::from(data), len),
        RangeRequest::Partial { start, end } => partial(
            Body::from(data.slice(start as usize..=end as usize)),
            start,
            end,
            len,
        ),
        RangeRequest::Unsatisfiable => unsatisfiable(len),
    }
}

fn full(body: Body, len: u64) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    response
}

fn partial(body: Body, start: u64, end: u64, len: u64) -> Response {
    let mut response = full(body, end - start + 1);
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    if let Ok(range) = HeaderValue::from_str(&format!("bytes {start}-{end}/{len}")) {
        response.headers_mut().insert(CONTENT_RANGE, range);
    }
    response
}

fn unsatisfiable(len: u64) -> Response {
    let mut response = full(Body::empty(), 0);
    *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
    if let Ok(range) = HeaderValue::from_str(&format!("bytes */{len}")) {
        response.headers_mut().insert(CONTENT_RANGE, range);
    }
    response
}

/// Keep only bytes `start..=end` of a stream.
fn slice_stream(mut inner: ByteStream, start: u64, end: u64) -> ByteStream {
    let stream = async_stream::try_stream! {
        let mut offset = 0u64;
        while let Some(chunk) = inner.next().await {
            let chunk = chunk?;
            let chunk_end = offset + chunk.len() as u64;
            if chunk_end > start {
                let from = start.saturating_sub(offset) as usize;
                let to = ((end + 1).min(chunk_end) - offset) as usize;
                if from < to {
                    yield chunk.slice(from..to);
                }
            }
            offset = chunk_end;
            if offset > end {
                break;
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn parses_single_ranges() {
        assert_eq!(parse_range(None, 100), RangeRequest::Full);
        assert_eq!(
            parse_range(Some("bytes=0-9"), 100),
            RangeRequest::Partial { start: 0, end: 9 }
        );
        assert_eq!(
            parse_range(Some("bytes=90-"), 100),
            RangeRequest::Partial { start: 90, end: 99 }
        );
        assert_eq!(
            parse_range(Some("bytes=-10"), 100),
            RangeRequest::Partial { start: 90, end: 99 }
        );
        assert_eq!(
            parse_range(Some("bytes=50-500"), 100),
            RangeRequest::Partial { start: 50, end: 99 }
        );
    }

    #[test]
    fn odd_ranges_fall_back_or_fail() {
        assert_eq!(parse_range(Some("bytes=0-1,5-6"), 100), RangeRequest::Full);
        assert_eq!(parse_range(Some("items=0-1"), 100), RangeRequest::Full);
        assert_eq!(parse_range(Some("bytes=9-2"), 100), RangeRequest::Full);
        assert_eq!(parse_range(Some("bytes=100-"), 100), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-0"), 100), RangeRequest::Unsatisfiable);
    }

    #[tokio::test]
    async fn partial_bytes_carry_content_range() {
        let responder = Responder::new("acme", "image/png", Instant::now());
        let response = responder.bytes(Bytes::from_static(b"0123456789"), false, Some("bytes=2-4"));

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 2-4/10");
        assert_eq!(response.headers()["cache-tag"], "acme");
        assert_eq!(response.headers()["x-cached-response"], "false");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"234");
    }

    #[tokio::test]
    async fn stream_slicing_spans_chunks() {
        let chunks: Vec<prism_storage::StorageResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"efgh")),
            Ok(Bytes::from_static(b"ijkl")),
        ];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));

        let responder = Responder::new("acme", "video/mp4", Instant::now());
        let response = responder.stream(stream, 12, true, Some("bytes=3-8"));
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"defghi");
    }

    #[test]
    fn placeholders_are_never_cached() {
        let responder = Responder::new("acme", "video/mp4", Instant::now());
        let response = responder.placeholder(Bytes::from_static(b"wait"), None);
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            response.headers()[CACHE_CONTROL],
            "private, no-cache, no-store, must-revalidate"
        );
        assert_eq!(response.headers()[EXPIRES], "-1");
        assert_eq!(response.headers()[PRAGMA], "no-cache");
    }

    #[tokio::test]
    async fn placeholders_honor_ranges() {
        let responder = Responder::new("acme", "video/mp4", Instant::now());
        let response = responder.placeholder(Bytes::from_static(b"placeholder"), Some("bytes=0-4"));

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 0-4/11");
        assert_eq!(response.headers()[PRAGMA], "no-cache");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"place");

        let response = responder.placeholder(Bytes::from_static(b"placeholder"), Some("bytes=50-"));
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */11");
    }

    #[test]
    fn unsatisfiable_reports_length() {
        let responder = Responder::new("acme", "image/png", Instant::now());
        let response = responder.bytes(Bytes::from_static(b"abc"), true, Some("bytes=10-"));
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */3");
    }
}
