//! Flash node HTTP API
//!
//! `/stat`, `/evictVol` and `/evictAll` reply with the `{code, msg, data}`
//! envelope; `/cacheRead` returns the cached bytes as the body.

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use cubefs_cache::{CacheBlockKey, CacheEngine, CacheStatus};
use cubefs_common::{DataSource, Error, HttpReply};
use serde::Deserialize;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tower_http::trace::TraceLayer;

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match self.0 {
            Error::CacheClosed => StatusCode::SERVICE_UNAVAILABLE,
            ref e => StatusCode::from_u16(e.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };
        (code, Json(HttpReply::<()>::err(self.0.to_string()))).into_response()
    }
}

pub fn router(engine: Arc<CacheEngine>) -> Router {
    Router::new()
        .route("/stat", get(stat))
        .route("/evictVol", get(evict_volume))
        .route("/evictAll", get(evict_all))
        .route("/cacheRead", post(cache_read))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn stat(State(engine): State<Arc<CacheEngine>>) -> Json<HttpReply<CacheStatus>> {
    Json(HttpReply::ok(engine.status()))
}

#[derive(Deserialize)]
struct VolumeParams {
    #[serde(default)]
    volume: String,
}

async fn evict_volume(
    State(engine): State<Arc<CacheEngine>>,
    Query(params): Query<VolumeParams>,
) -> Response {
    if params.volume.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(HttpReply::<()>::err("volume name can not be empty")),
        )
            .into_response();
    }
    Json(HttpReply::ok(engine.evict_volume(&params.volume))).into_response()
}

async fn evict_all(State(engine): State<Arc<CacheEngine>>) -> Json<HttpReply<usize>> {
    Json(HttpReply::ok(engine.evict_all()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheReadRequest {
    pub key: CacheBlockKey,
    pub sources: Vec<DataSource>,
    /// Offset inside the block
    pub offset: u64,
    pub size: u64,
}

async fn cache_read(
    State(engine): State<Arc<CacheEngine>>,
    Json(req): Json<CacheReadRequest>,
) -> Result<Response, ApiError> {
    let data = engine
        .read(&req.key, &req.sources, req.offset, req.size, None)
        .await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

pub fn render_metrics(engine: &CacheEngine) -> String {
    let mut out = String::with_capacity(1024);
    let stats = engine.stats();
    let status = engine.status();
    let counters = [
        ("cubefs_flash_cache_hits_total", "Reads served by an existing block", stats.hits.load(Ordering::Relaxed)),
        ("cubefs_flash_cache_misses_total", "Reads that created a block", stats.misses.load(Ordering::Relaxed)),
        ("cubefs_flash_hydrations_total", "Blocks hydrated from origin", stats.hydrations.load(Ordering::Relaxed)),
        ("cubefs_flash_hydration_failures_total", "Hydrations that closed the block", stats.hydration_failures.load(Ordering::Relaxed)),
        ("cubefs_flash_evictions_total", "Blocks evicted", stats.evictions.load(Ordering::Relaxed)),
        ("cubefs_flash_closed_retries_total", "Reads retried on a closed block", stats.closed_retries.load(Ordering::Relaxed)),
    ];
    for (name, help, value) in counters {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(out, "{name} {value}");
    }
    let gauges = [
        ("cubefs_flash_capacity_bytes", "tmpfs bytes the engine may reserve", status.total_capacity),
        ("cubefs_flash_reserved_bytes", "tmpfs bytes reserved by blocks", status.reserved),
        ("cubefs_flash_blocks", "Cache blocks", status.blocks as u64),
        ("cubefs_flash_hydrating_blocks", "Cache blocks still hydrating", status.hydrating_blocks as u64),
    ];
    for (name, help, value) in gauges {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        let _ = writeln!(out, "{name} {value}");
    }
    out
}

async fn metrics(State(engine): State<Arc<CacheEngine>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(&engine),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use cubefs_cache::{BlockSink, CacheEngineConfig, SourceReader};
    use cubefs_common::{CACHE_BLOCK_SIZE, Result};
    use tower::ServiceExt;

    /// Fills each source with its extent id as the byte value
    struct FillReader;

    #[async_trait]
    impl SourceReader for FillReader {
        async fn read_source(&self, source: &DataSource, sink: &mut BlockSink<'_>) -> Result<u64> {
            if source.extent_id == 0 {
                return Err(Error::PeerUnreachable("extent 0 is unreadable".into()));
            }
            let byte = u8::try_from(source.extent_id % 256).unwrap();
            sink.write(&vec![byte; usize::try_from(source.size).unwrap()])?;
            Ok(source.size)
        }
    }

    fn test_engine(dir: &std::path::Path) -> Arc<CacheEngine> {
        let config = CacheEngineConfig {
            cache_path: dir.to_path_buf(),
            total_capacity: 16 * CACHE_BLOCK_SIZE,
            block_size: CACHE_BLOCK_SIZE,
            worker_max: 4,
        };
        Arc::new(CacheEngine::open(config, Arc::new(FillReader)).unwrap())
    }

    fn read_body(volume: &str, extent_id: u64) -> String {
        serde_json::json!({
            "key": {"volume": volume, "inode": 7, "fixedOffset": 0, "version": 1},
            "sources": [
                {"partition_id": 1, "extent_id": extent_id, "extent_offset": 0,
                 "file_offset": 0, "size": 8192, "hosts": ["127.0.0.1:17310"]},
                {"partition_id": 1, "extent_id": extent_id + 1, "extent_offset": 0,
                 "file_offset": 8192, "size": 4096, "hosts": ["127.0.0.1:17310"]}
            ],
            "offset": 4096,
            "size": 8192
        })
        .to_string()
    }

    async fn call(app: &Router, method: &str, uri: &str, body: String) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_cache_read_then_stat_and_evict() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let app = router(Arc::clone(&engine));

        let response = call(&app, "POST", "/cacheRead", read_body("volA", 5)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let data = body_bytes(response).await;
        let mut want = vec![5u8; 4096];
        want.extend_from_slice(&[6u8; 4096]);
        assert_eq!(data, want);

        let response = call(&app, "GET", "/stat", String::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let reply: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(reply["data"]["blocks"], 1);
        assert_eq!(reply["data"]["volumes"]["volA"], 1);

        let response = call(&app, "GET", "/evictVol", String::new()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = call(&app, "GET", "/evictVol?volume=volA", String::new()).await;
        let reply: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(reply["data"], 1);
        assert_eq!(engine.status().blocks, 0);

        let metrics = body_bytes(call(&app, "GET", "/metrics", String::new()).await).await;
        let metrics = String::from_utf8(metrics).unwrap();
        assert!(metrics.contains("cubefs_flash_cache_misses_total 1"));
        assert!(metrics.contains("cubefs_flash_evictions_total 1"));
    }

    #[tokio::test]
    async fn test_cache_read_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let app = router(Arc::clone(&engine));

        // first source cannot be read
        let response = call(&app, "POST", "/cacheRead", read_body("volB", 0)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(engine.status().blocks, 0);

        let response = call(&app, "POST", "/cacheRead", "{}".to_string()).await;
        assert!(response.status().is_client_error());

        call(&app, "POST", "/cacheRead", read_body("volC", 3)).await;
        let response = call(&app, "GET", "/evictAll", String::new()).await;
        let reply: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(reply["data"], 1);
    }
}
