//! Metrics instrumentation for domainwatch.
//!
//! All collectors live in one [`Metrics`] struct registered against a
//! dedicated [`prometheus::Registry`], so the scrape endpoint and the push
//! client observe the same families. Metric names are prefixed with `dns_`.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CollectorError;
use crate::store::Store;

/// Interval for refreshing the inventory gauges.
const DB_GAUGE_INTERVAL: Duration = Duration::from_secs(15);

/// All collectors of the pipeline.
pub struct Metrics {
    registry: Registry,

    /// Domains a worker finished with, by `status` (success/no_results).
    pub resolver_domains_processed: IntCounterVec,
    /// Lookups performed, by `ip_version` and `status`.
    pub resolver_lookups: IntCounterVec,
    /// Lookup latency, by `ip_version`.
    pub resolver_lookup_duration: HistogramVec,
    /// Domains in the batch currently being resolved.
    pub resolver_batch_size: IntGauge,
    /// Workers currently draining a batch.
    pub resolver_active_workers: IntGauge,

    /// Datagrams received, by `status` (valid/invalid/dropped).
    pub server_messages_received: IntCounterVec,
    /// Valid query events, by `rtype`.
    pub server_domains_received: IntCounterVec,
    /// First sightings of a domain.
    pub server_new_domains: IntCounter,
    /// Time spent handling one datagram.
    pub server_processing_time: Histogram,

    /// Stat rows removed by retention.
    pub cleanup_stats_deleted: IntCounter,
    /// Expired IP rows removed while their domain stayed active.
    pub cleanup_ips_deleted: IntCounter,
    /// Expired domain rows removed.
    pub cleanup_domains_deleted: IntCounter,
    /// IP rows removed by the domain-expiry cascade.
    pub cleanup_domain_ips_deleted: IntCounter,
    /// Wall time of one full retention run.
    pub cleanup_duration: Histogram,
    /// Retention runs started.
    pub cleanup_runs: IntCounter,

    /// Domains currently in the store.
    pub db_domains_total: IntGauge,
    /// IP rows currently in the store.
    pub db_ips_total: IntGauge,
}

impl Metrics {
    /// Create and register all collectors.
    pub fn new() -> Result<Self, CollectorError> {
        let registry = Registry::new();

        let resolver_domains_processed = IntCounterVec::new(
            Opts::new(
                "dns_resolver_domains_processed_total",
                "Total number of domains processed by the resolver",
            ),
            &["status"],
        )?;
        let resolver_lookups = IntCounterVec::new(
            Opts::new(
                "dns_resolver_lookups_total",
                "Total number of DNS lookups performed",
            ),
            &["ip_version", "status"],
        )?;
        let resolver_lookup_duration = HistogramVec::new(
            HistogramOpts::new(
                "dns_resolver_lookup_duration_seconds",
                "Duration of DNS lookup operations",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["ip_version"],
        )?;
        let resolver_batch_size = IntGauge::new(
            "dns_resolver_batch_size",
            "Number of domains in the current resolution batch",
        )?;
        let resolver_active_workers = IntGauge::new(
            "dns_resolver_active_workers",
            "Number of currently active resolver workers",
        )?;

        let server_messages_received = IntCounterVec::new(
            Opts::new(
                "dns_server_messages_received_total",
                "Total number of UDP messages received",
            ),
            &["status"],
        )?;
        let server_domains_received = IntCounterVec::new(
            Opts::new(
                "dns_server_domains_received_total",
                "Total number of domains received via UDP",
            ),
            &["rtype"],
        )?;
        let server_new_domains = IntCounter::new(
            "dns_server_new_domains_total",
            "Total number of new unique domains registered",
        )?;
        let server_processing_time = Histogram::with_opts(
            HistogramOpts::new(
                "dns_server_processing_duration_seconds",
                "Time spent processing UDP messages",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1]),
        )?;

        let cleanup_stats_deleted = IntCounter::new(
            "dns_cleanup_stats_deleted_total",
            "Total number of old stats records deleted",
        )?;
        let cleanup_ips_deleted = IntCounter::new(
            "dns_cleanup_ips_deleted_total",
            "Total number of expired IP addresses deleted",
        )?;
        let cleanup_domains_deleted = IntCounter::new(
            "dns_cleanup_domains_deleted_total",
            "Total number of old domains deleted",
        )?;
        let cleanup_domain_ips_deleted = IntCounter::new(
            "dns_cleanup_domain_ips_deleted_total",
            "Total number of IP addresses deleted with old domains",
        )?;
        let cleanup_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dns_cleanup_duration_seconds",
                "Duration of cleanup operations",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let cleanup_runs =
            IntCounter::new("dns_cleanup_runs_total", "Total number of cleanup runs")?;

        let db_domains_total = IntGauge::new(
            "dns_db_domains_total",
            "Total number of domains in the store",
        )?;
        let db_ips_total = IntGauge::new(
            "dns_db_ips_total",
            "Total number of IP addresses in the store",
        )?;

        registry.register(Box::new(resolver_domains_processed.clone()))?;
        registry.register(Box::new(resolver_lookups.clone()))?;
        registry.register(Box::new(resolver_lookup_duration.clone()))?;
        registry.register(Box::new(resolver_batch_size.clone()))?;
        registry.register(Box::new(resolver_active_workers.clone()))?;
        registry.register(Box::new(server_messages_received.clone()))?;
        registry.register(Box::new(server_domains_received.clone()))?;
        registry.register(Box::new(server_new_domains.clone()))?;
        registry.register(Box::new(server_processing_time.clone()))?;
        registry.register(Box::new(cleanup_stats_deleted.clone()))?;
        registry.register(Box::new(cleanup_ips_deleted.clone()))?;
        registry.register(Box::new(cleanup_domains_deleted.clone()))?;
        registry.register(Box::new(cleanup_domain_ips_deleted.clone()))?;
        registry.register(Box::new(cleanup_duration.clone()))?;
        registry.register(Box::new(cleanup_runs.clone()))?;
        registry.register(Box::new(db_domains_total.clone()))?;
        registry.register(Box::new(db_ips_total.clone()))?;

        Ok(Self {
            registry,
            resolver_domains_processed,
            resolver_lookups,
            resolver_lookup_duration,
            resolver_batch_size,
            resolver_active_workers,
            server_messages_received,
            server_domains_received,
            server_new_domains,
            server_processing_time,
            cleanup_stats_deleted,
            cleanup_ips_deleted,
            cleanup_domains_deleted,
            cleanup_domain_ips_deleted,
            cleanup_duration,
            cleanup_runs,
            db_domains_total,
            db_ips_total,
        })
    }

    /// The underlying registry (scrape endpoint, push client).
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the current families in the textual exposition format.
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed seconds since timer start.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

async fn scrape(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

/// Serve the scrape endpoint and `/health` until shutdown.
pub async fn serve_scrape(
    port: u16,
    path: String,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<(), CollectorError> {
    let app = Router::new()
        .route(&path, get(scrape))
        .route("/health", get(health))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, %path, "metrics exposition listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("metrics exposition stopped");
    Ok(())
}

/// Periodically refresh the inventory gauges from store counts.
pub async fn run_db_gauges(store: Store, metrics: Arc<Metrics>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(DB_GAUGE_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.count_domains().await {
                    Ok(n) => metrics.db_domains_total.set(n),
                    Err(e) => warn!("failed to count domains: {}", e),
                }
                match store.count_ips().await {
                    Ok(n) => metrics.db_ips_total.set(n),
                    Err(e) => warn!("failed to count IPs: {}", e),
                }
                debug!(
                    domains = metrics.db_domains_total.get(),
                    ips = metrics.db_ips_total.get(),
                    "refreshed inventory gauges"
                );
            }
            _ = shutdown.cancelled() => {
                debug!("inventory gauge loop shutting down");
                return;
            }
        }
    }
}
