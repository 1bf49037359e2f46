//! Metrics and tracing setup for cirrus nodes.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a cirrus node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Query counters ──
    pub reads: IntCounter,
    pub writes: IntCounter,
    pub deletes: IntCounter,
    pub write_timeouts: IntCounter,
    pub read_timeouts: IntCounter,
    pub unavailable: IntCounter,
    /// Per-replica call failures absorbed by the coordinator.
    pub replica_failures: IntCounter,

    // ── Query latency ──
    pub op_latency_secs: HistogramVec,

    // ── Hints ──
    pub hints_stored: IntCounter,
    pub hints_delivered: IntCounter,
    /// Hints dropped at their deadline: writes permanently lost for a replica.
    pub hints_expired: IntCounter,
    pub hint_delivery_failures: IntCounter,

    // ── Read repair ──
    pub read_repairs: IntCounter,
    pub repair_writes: IntCounter,
    pub repair_failures: IntCounter,

    // ── Materialized views ──
    pub view_updates: IntCounter,
    pub view_failures: IntCounter,
    pub view_batches_replayed: IntCounter,

    // ── Tombstones & compaction ──
    pub tombstone_warnings: IntCounter,
    pub tombstone_failures: IntCounter,
    pub tombstones_scanned: Histogram,
    pub compactions: IntCounter,
    pub compactions_stale: IntCounter,
    pub tombstones_purged: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for query latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Buckets for tombstones scanned per read.
const TOMBSTONE_BUCKETS: &[f64] = &[0.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0];

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("counter opts");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();
        let r = &registry;

        let op_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "cirrus_op_latency_seconds",
                "Coordinator operation latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("op_latency_secs histogram");
        registry
            .register(Box::new(op_latency_secs.clone()))
            .expect("register op_latency_secs");

        let tombstones_scanned = Histogram::with_opts(
            HistogramOpts::new(
                "cirrus_tombstones_scanned",
                "Tombstones scanned per replica read",
            )
            .buckets(TOMBSTONE_BUCKETS.to_vec()),
        )
        .expect("tombstones_scanned histogram");
        registry
            .register(Box::new(tombstones_scanned.clone()))
            .expect("register tombstones_scanned");

        Self {
            reads: counter(r, "cirrus_reads_total", "Coordinated reads"),
            writes: counter(r, "cirrus_writes_total", "Coordinated writes"),
            deletes: counter(r, "cirrus_deletes_total", "Coordinated deletes"),
            write_timeouts: counter(r, "cirrus_write_timeouts_total", "Writes failing their consistency level"),
            read_timeouts: counter(r, "cirrus_read_timeouts_total", "Reads failing their consistency level"),
            unavailable: counter(r, "cirrus_unavailable_total", "Queries rejected before fan-out"),
            replica_failures: counter(r, "cirrus_replica_failures_total", "Failed replica calls"),
            op_latency_secs,
            hints_stored: counter(r, "cirrus_hints_stored_total", "Hints stored for hinted handoff"),
            hints_delivered: counter(r, "cirrus_hints_delivered_total", "Hints successfully delivered"),
            hints_expired: counter(r, "cirrus_hints_expired_total", "Hints dropped past their deadline"),
            hint_delivery_failures: counter(r, "cirrus_hint_delivery_failures_total", "Failed hint delivery attempts"),
            read_repairs: counter(r, "cirrus_read_repairs_total", "Reads that found divergent replicas"),
            repair_writes: counter(r, "cirrus_repair_writes_total", "Repair writes sent to stale replicas"),
            repair_failures: counter(r, "cirrus_repair_failures_total", "Repair writes that failed"),
            view_updates: counter(r, "cirrus_view_updates_total", "View mutations replicated"),
            view_failures: counter(r, "cirrus_view_failures_total", "Writes failed by view propagation"),
            view_batches_replayed: counter(r, "cirrus_view_batches_replayed_total", "View batches re-delivered from the batchlog"),
            tombstone_warnings: counter(r, "cirrus_tombstone_warnings_total", "Reads over the tombstone warn threshold"),
            tombstone_failures: counter(r, "cirrus_tombstone_failures_total", "Reads over the tombstone fail threshold"),
            tombstones_scanned,
            compactions: counter(r, "cirrus_compactions_total", "Partition compactions swapped in"),
            compactions_stale: counter(r, "cirrus_compactions_stale_total", "Partition compactions discarded as stale"),
            tombstones_purged: counter(r, "cirrus_tombstones_purged_total", "Tombstones and expired cells purged"),
            registry,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start an operation latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_op_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .op_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
