//! Data node HTTP API
//!
//! Operator status endpoints, the peer endpoints used by repair, and the write/delete
//! entry points. JSON replies use the `{code, msg, data}` envelope;
//! `/extentData` and `/tinyDelete` return raw bytes.

use crate::issue::Fragment;
use crate::partition::{DataPartition, PartitionStatus};
use crate::payload::RandomWriteCommand;
use crate::peer::{AvailRange, EXTENT_CRC_HEADER};
use crate::space::SpaceManager;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use cubefs_common::checksum::crc32;
use cubefs_common::{Error, ExtentInfo, HttpReply, Opcode};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tower_http::trace::TraceLayer;

/// Error reply carrying the status the error maps to
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let msg = match self.0 {
            Error::ExtentNotFound(_) | Error::ExtentDeleted(_) => "extent not exist".to_string(),
            other => other.to_string(),
        };
        (code, Json(HttpReply::<()>::err(msg))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn reply<T: Serialize>(data: T) -> Json<HttpReply<T>> {
    Json(HttpReply::ok(data))
}

pub fn router(space: Arc<SpaceManager>) -> Router {
    Router::new()
        .route("/partitions", get(list_partitions))
        .route("/partition", get(get_partition))
        .route("/extentInfo", get(extent_info))
        .route("/extentData", get(extent_data))
        .route("/createExtent", post(create_extent))
        .route("/randomWrite", post(random_write))
        .route("/markDelete", post(mark_delete))
        .route("/tinyExtents", get(tiny_extents))
        .route("/tinyExtentAvail", get(tiny_extent_avail))
        .route("/tinyDelete", get(tiny_delete))
        .route("/issues", get(issues))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(space)
}

fn partition(space: &SpaceManager, partition_id: u64) -> ApiResult<Arc<DataPartition>> {
    space.partition(partition_id).ok_or_else(|| {
        ApiError(Error::Configuration(format!(
            "partition {partition_id} not found"
        )))
    })
}

#[derive(Deserialize)]
struct IdParams {
    id: u64,
}

#[derive(Deserialize)]
struct ExtentParams {
    partition: u64,
    extent: u64,
}

#[derive(Deserialize)]
struct RangeParams {
    partition: u64,
    extent: u64,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    repair: u8,
}

#[derive(Deserialize)]
struct CreateParams {
    partition: u64,
    extent: Option<u64>,
}

#[derive(Deserialize)]
struct WriteParams {
    partition: u64,
    extent: u64,
    offset: u64,
    crc: Option<u32>,
    #[serde(default)]
    sync: bool,
}

#[derive(Deserialize)]
struct JournalParams {
    partition: u64,
    #[serde(default)]
    offset: u64,
    size: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteReply {
    result_code: u8,
    ok: bool,
}

#[derive(Serialize)]
struct TinyExtentsReply {
    available: Vec<u64>,
    broken: Vec<u64>,
}

async fn list_partitions(State(space): State<Arc<SpaceManager>>) -> Json<HttpReply<Vec<PartitionStatus>>> {
    reply(space.partitions().iter().map(|dp| dp.status()).collect())
}

async fn get_partition(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<IdParams>,
) -> ApiResult<Json<HttpReply<PartitionStatus>>> {
    Ok(reply(partition(&space, q.id)?.status()))
}

async fn extent_info(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<ExtentParams>,
) -> ApiResult<Json<HttpReply<ExtentInfo>>> {
    let dp = partition(&space, q.partition)?;
    let info = match dp.store().watermark(q.extent) {
        Err(Error::PartitionLoading) => ExtentInfo {
            file_id: q.extent,
            size: dp.store().load_extent_watermark(q.extent)?,
            ..ExtentInfo::default()
        },
        other => other?,
    };
    Ok(reply(info))
}

/// Raw extent bytes; the range is cut at the extent's end.
async fn extent_data(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<RangeParams>,
) -> ApiResult<Response> {
    let dp = partition(&space, q.partition)?;
    let is_repair = q.repair != 0;
    let size = dp.store().load_extent_watermark(q.extent)?;
    let len = size.saturating_sub(q.offset).min(q.size);
    let (data, crc) = if len == 0 {
        (Vec::new(), crc32(&[]))
    } else {
        dp.read(q.extent, q.offset, len, is_repair)?
    };
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::HeaderName::from_static(EXTENT_CRC_HEADER), crc.to_string()),
        ],
        data,
    )
        .into_response())
}

async fn create_extent(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<CreateParams>,
) -> ApiResult<Json<HttpReply<u64>>> {
    let dp = partition(&space, q.partition)?;
    Ok(reply(dp.create_extent(q.extent)?))
}

async fn random_write(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<WriteParams>,
    body: Bytes,
) -> ApiResult<Json<HttpReply<WriteReply>>> {
    let dp = partition(&space, q.partition)?;
    let opcode = if q.sync {
        Opcode::SyncRandomWrite
    } else {
        Opcode::RandomWrite
    };
    let crc = q.crc.unwrap_or_else(|| crc32(&body));
    let code = dp
        .submit(RandomWriteCommand::new(opcode, q.extent, q.offset, body, crc))
        .await?;
    Ok(reply(WriteReply {
        result_code: code as u8,
        ok: code.is_ok(),
    }))
}

async fn mark_delete(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<RangeParams>,
) -> ApiResult<Json<HttpReply<()>>> {
    let dp = partition(&space, q.partition)?;
    dp.mark_delete(q.extent, q.offset, q.size)?;
    Ok(reply(()))
}

async fn tiny_extents(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<IdParams>,
) -> ApiResult<Json<HttpReply<TinyExtentsReply>>> {
    let dp = partition(&space, q.id)?;
    let tiny = dp.store().tiny_extents();
    Ok(reply(TinyExtentsReply {
        available: tiny.available_ids(),
        broken: tiny.broken_ids(),
    }))
}

async fn tiny_extent_avail(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<RangeParams>,
) -> ApiResult<Json<HttpReply<AvailRange>>> {
    let dp = partition(&space, q.partition)?;
    let (start, end) = dp.store().tiny_extent_avail_offset(q.extent, q.offset)?;
    Ok(reply(AvailRange { start, end }))
}

/// Raw tiny-delete journal records from `offset`
async fn tiny_delete(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<JournalParams>,
) -> ApiResult<Vec<u8>> {
    let dp = partition(&space, q.partition)?;
    let total = dp.store().tiny_delete_file_size();
    let size = q.size.unwrap_or(total).min(total.saturating_sub(q.offset));
    if size == 0 {
        return Ok(Vec::new());
    }
    Ok(dp.store().read_tiny_delete_records(q.offset, size)?)
}

async fn issues(
    State(space): State<Arc<SpaceManager>>,
    Query(q): Query<IdParams>,
) -> ApiResult<Json<HttpReply<Vec<Fragment>>>> {
    Ok(reply(partition(&space, q.id)?.issues().fragments()))
}

/// Prometheus text exposition of store, cache and partition counters
pub fn render_metrics(space: &SpaceManager) -> String {
    let mut out = String::with_capacity(4096);
    let gauges: [(&str, &str, fn(&DataPartition) -> u64); 12] = [
        ("cubefs_dp_applied_id", "Applied raft index", |dp| dp.applied_id()),
        ("cubefs_dp_persisted_applied_id", "Persisted applied raft index", |dp| dp.persisted_applied_id()),
        ("cubefs_dp_extents", "Extents in the partition", |dp| dp.store().extent_count() as u64),
        ("cubefs_dp_used_bytes", "Bytes used by extents", |dp| dp.store().store_used_size()),
        ("cubefs_dp_store_writes_total", "Extent writes", |dp| dp.store().stats().writes.load(Ordering::Relaxed)),
        ("cubefs_dp_store_write_bytes_total", "Extent bytes written", |dp| dp.store().stats().write_bytes.load(Ordering::Relaxed)),
        ("cubefs_dp_store_reads_total", "Extent reads", |dp| dp.store().stats().reads.load(Ordering::Relaxed)),
        ("cubefs_dp_illegal_overwrites_total", "Random writes rejected by the block crc check", |dp| dp.store().stats().illegal_overwrites.load(Ordering::Relaxed)),
        ("cubefs_dp_overwrite_bytes_total", "Bytes applied by random writes", |dp| dp.stats().overwrite_bytes.load(Ordering::Relaxed)),
        ("cubefs_dp_repairs_total", "Random write repairs attempted", |dp| dp.stats().repairs.load(Ordering::Relaxed)),
        ("cubefs_dp_apply_failures_total", "Random writes that could not be applied", |dp| dp.stats().apply_failures.load(Ordering::Relaxed) + dp.stats().disk_errors.load(Ordering::Relaxed)),
        ("cubefs_dp_issue_fragments", "Ranges waiting for repair", |dp| dp.issues().len() as u64),
    ];
    let partitions = space.partitions();
    for (name, help, value) in gauges {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        for dp in &partitions {
            let _ = writeln!(out, "{name}{{partition=\"{}\"}} {}", dp.partition_id(), value(dp));
        }
    }
    let _ = writeln!(out, "# HELP cubefs_dp_extent_cache_hit_ratio Extent handle cache hit ratio");
    let _ = writeln!(out, "# TYPE cubefs_dp_extent_cache_hit_ratio gauge");
    for dp in &partitions {
        let _ = writeln!(
            out,
            "cubefs_dp_extent_cache_hit_ratio{{partition=\"{}\"}} {:.4}",
            dp.partition_id(),
            dp.store().cache_stats().hit_ratio()
        );
    }
    out
}

async fn metrics(State(space): State<Arc<SpaceManager>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(&space),
    )
}
