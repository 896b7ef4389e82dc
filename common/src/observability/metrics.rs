//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` per process. Receive-side and send-side counters are
//! grouped so each pipeline only carries the handles it touches; both groups
//! are registered in the same registry so a node running either mode exposes
//! a stable set of series.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9200`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Receive pipeline counters.
#[derive(Clone)]
pub struct ReceiverMetrics {
    // ---
    pub packets_received_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub parse_errors_total: IntCounterVec,
    pub size_mismatch_total: IntCounter,
    pub non_primary_total: IntCounter,
    pub packets_lost_total: IntCounter,
    pub unsynchronized_total: IntCounter,

    pub buffer_overruns_total: IntCounter,
    pub buffer_underruns_total: IntCounter,
    pub buffer_fill_chunks: IntGauge,
    pub buffer_target_chunks: IntGauge,

    pub playout_late_drops_total: IntCounter,
    pub playout_early_drops_total: IntCounter,
    pub sink_writes_total: IntCounter,
    pub sink_errors_total: IntCounter,
    pub playout_wait_seconds: Histogram,

    pub rtcp_packets_total: IntCounterVec,
    pub rtcp_rr_sent_total: IntCounter,
    pub sap_announcements_total: IntCounter,
    pub multicast_joins_total: IntCounter,
}

/// Send pipeline counters.
#[derive(Clone)]
pub struct SenderMetrics {
    // ---
    pub packets_sent_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub source_underflows_total: IntCounter,
    pub send_retries_total: IntCounter,
    pub send_drops_total: IntCounter,
    pub rtcp_sr_sent_total: IntCounter,
    pub sap_announcements_sent_total: IntCounter,
}

/// Prometheus metrics registry + handles.
///
/// This is a thin, explicit wrapper around the `prometheus` crate so hot-path
/// instrumentation is just counter increments / histogram observations.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,
    pub rx: ReceiverMetrics,
    pub tx: SenderMetrics,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    // ---
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> Result<IntCounterVec> {
    // ---
    let c = IntCounterVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    // ---
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl ReceiverMetrics {
    // ---
    fn register(r: &Registry) -> Result<Self> {
        // ---
        let playout_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "playout_wait_seconds",
                "Scheduled wait between chunk pop and sink write (seconds)",
            )
            .buckets(vec![0.0, 0.001, 0.002, 0.004, 0.006, 0.01, 0.02, 0.05, 0.1, 0.5]),
        )?;
        r.register(Box::new(playout_wait_seconds.clone()))?;

        Ok(Self {
            packets_received_total: counter(r, "rtp_packets_received_total", "RTP packets accepted")?,
            bytes_received_total: counter(r, "rtp_bytes_received_total", "RTP datagram bytes received")?,
            parse_errors_total: counter_vec(r, "rtp_parse_errors_total", "Datagrams rejected by the parser", "kind")?,
            size_mismatch_total: counter(r, "rtp_size_mismatch_total", "Payloads dropped for not matching the chunk size")?,
            non_primary_total: counter(r, "rtp_non_primary_total", "Packets from tracked but non-primary SSRCs")?,
            packets_lost_total: counter(r, "rtp_packets_lost_total", "Packets detected as lost from sequence gaps")?,
            unsynchronized_total: counter(r, "rtp_unsynchronized_total", "Chunks queued without a usable clock mapping")?,
            buffer_overruns_total: counter(r, "jitter_buffer_overruns_total", "Oldest chunks overwritten on a full buffer")?,
            buffer_underruns_total: counter(r, "jitter_buffer_underruns_total", "Transitions into underrun")?,
            buffer_fill_chunks: gauge(r, "jitter_buffer_fill_chunks", "Chunks currently buffered")?,
            buffer_target_chunks: gauge(r, "jitter_buffer_target_chunks", "Current adaptive target fill")?,
            playout_late_drops_total: counter(r, "playout_late_drops_total", "Chunks dropped as too late")?,
            playout_early_drops_total: counter(r, "playout_early_drops_total", "Chunks dropped as too early")?,
            sink_writes_total: counter(r, "sink_writes_total", "Chunks written to the sample sink")?,
            sink_errors_total: counter(r, "sink_errors_total", "Sample sink write failures")?,
            playout_wait_seconds,
            rtcp_packets_total: counter_vec(r, "rtcp_packets_received_total", "RTCP sub-packets received", "type")?,
            rtcp_rr_sent_total: counter(r, "rtcp_rr_sent_total", "Receiver reports sent")?,
            sap_announcements_total: counter(r, "sap_announcements_received_total", "SAP announcements parsed")?,
            multicast_joins_total: counter(r, "multicast_joins_total", "IP_ADD_MEMBERSHIP operations performed")?,
        })
    }
}

impl SenderMetrics {
    // ---
    fn register(r: &Registry) -> Result<Self> {
        // ---
        Ok(Self {
            packets_sent_total: counter(r, "rtp_packets_sent_total", "RTP packets sent")?,
            bytes_sent_total: counter(r, "rtp_bytes_sent_total", "RTP datagram bytes sent")?,
            source_underflows_total: counter(r, "source_underflows_total", "Pacer ticks without a full chunk")?,
            send_retries_total: counter(r, "send_retries_total", "Transient send failures retried")?,
            send_drops_total: counter(r, "send_drops_total", "Packets dropped after a failed retry")?,
            rtcp_sr_sent_total: counter(r, "rtcp_sr_sent_total", "Sender reports sent")?,
            sap_announcements_sent_total: counter(r, "sap_announcements_sent_total", "SAP announcements sent")?,
        })
    }
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("scream_rtp".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let rx = ReceiverMetrics::register(&registry)?;
        let tx = SenderMetrics::register(&registry)?;

        Ok(Self { registry, rx, tx })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { serve_metrics(req, registry).await }
                    }))
                }
            });

            let server = Server::try_bind(&cfg.bind)?.serve(make_svc);
            info!("Metrics endpoint on http://{}/metrics", cfg.bind);
            server.await?;
            Ok(())
        })
    }
}

async fn serve_metrics(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    // ---
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut resp = Response::new(Body::from("not found"));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        let mut resp = Response::new(Body::from(format!("encode error: {e}")));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(resp);
    }

    let mut resp = Response::new(Body::from(buffer));
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(resp)
}
