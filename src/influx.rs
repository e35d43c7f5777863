//! InfluxDB push client.
//!
//! Periodically projects the gathered metric families into line protocol
//! and writes them to an InfluxDB v2 instance, one point per metric.
//! Counters and gauges map to a single `value` field; histograms to
//! `count`/`sum` plus one field per bucket; summaries to `count`/`sum`
//! plus one field per quantile. Failed points are tallied and logged, and
//! only a batch with zero successes surfaces as an error.

use prometheus::proto::{Metric, MetricFamily, MetricType};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PushConfig;
use crate::error::CollectorError;
use crate::metrics::Metrics;

/// Deadline for one write request.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for the startup health probe.
const HEALTH_DEADLINE: Duration = Duration::from_secs(5);

/// Periodic metrics push towards InfluxDB.
pub struct InfluxPush {
    cfg: PushConfig,
    metrics: Arc<Metrics>,
    client: reqwest::Client,
}

impl InfluxPush {
    /// Build the push client from configuration.
    pub fn new(cfg: PushConfig, metrics: Arc<Metrics>) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .timeout(WRITE_DEADLINE)
            .danger_accept_invalid_certs(cfg.insecure_skip_verify)
            .build()?;

        Ok(Self {
            cfg,
            metrics,
            client,
        })
    }

    /// Probe the sink's health endpoint. A dead sink at boot is reported
    /// to the caller, which downgrades the push to disabled.
    pub async fn check_health(&self) -> Result<(), CollectorError> {
        let url = format!("{}/health", self.cfg.url.trim_end_matches('/'));
        self.client
            .get(&url)
            .timeout(HEALTH_DEADLINE)
            .send()
            .await?
            .error_for_status()?;

        info!(
            url = %self.cfg.url,
            organization = %self.cfg.organization,
            bucket = %self.cfg.bucket,
            "push sink reachable"
        );
        Ok(())
    }

    /// Push on every interval tick until shutdown.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.interval_seconds));
        // The immediate first tick would push an all-zero snapshot.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.push_once().await;
                }
                _ = shutdown.cancelled() => {
                    info!("push client stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Gather the registry and write one point per metric.
    async fn push_once(&self) {
        let families = self.metrics.registry().gather();
        let timestamp_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();

        let mut lines = Vec::new();
        for family in &families {
            lines.extend(family_to_lines(family, timestamp_ns));
        }

        let url = format!("{}/api/v2/write", self.cfg.url.trim_end_matches('/'));
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut last_error = None;

        for line in lines {
            let result = self
                .client
                .post(&url)
                .query(&[
                    ("org", self.cfg.organization.as_str()),
                    ("bucket", self.cfg.bucket.as_str()),
                    ("precision", "ns"),
                ])
                .header("Authorization", format!("Token {}", self.cfg.token))
                .body(line.clone())
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    warn!(point = %line, "failed to write metric point: {}", e);
                    last_error = Some(e);
                }
            }
        }

        if failed > 0 {
            if succeeded == 0 {
                if let Some(e) = last_error {
                    error!(failed, "all metric points failed to write: {}", e);
                }
            } else {
                warn!(succeeded, failed, "partial push batch failure");
            }
        } else {
            debug!(points = succeeded, "pushed metrics batch");
        }
    }
}

/// Encode every metric of a family as line protocol.
pub fn family_to_lines(family: &MetricFamily, timestamp_ns: i64) -> Vec<String> {
    family
        .get_metric()
        .iter()
        .filter_map(|metric| {
            let fields = metric_fields(family.get_field_type(), metric)?;
            Some(encode_point(family.get_name(), metric, &fields, timestamp_ns))
        })
        .collect()
}

/// Flatten one metric into its line protocol fields.
fn metric_fields(mtype: MetricType, metric: &Metric) -> Option<Vec<(String, f64)>> {
    match mtype {
        MetricType::COUNTER => Some(vec![(
            "value".to_string(),
            metric.get_counter().get_value(),
        )]),
        MetricType::GAUGE => Some(vec![("value".to_string(), metric.get_gauge().get_value())]),
        MetricType::HISTOGRAM => {
            let histogram = metric.get_histogram();
            let mut fields = vec![
                ("count".to_string(), histogram.get_sample_count() as f64),
                ("sum".to_string(), histogram.get_sample_sum()),
            ];
            for bucket in histogram.get_bucket() {
                fields.push((
                    bucket_field_name(bucket.get_upper_bound()),
                    bucket.get_cumulative_count() as f64,
                ));
            }
            Some(fields)
        }
        MetricType::SUMMARY => {
            let summary = metric.get_summary();
            let mut fields = vec![
                ("count".to_string(), summary.get_sample_count() as f64),
                ("sum".to_string(), summary.get_sample_sum()),
            ];
            for quantile in summary.get_quantile() {
                fields.push((
                    format!("quantile_{}", quantile.get_quantile()),
                    quantile.get_value(),
                ));
            }
            Some(fields)
        }
        _ => None,
    }
}

fn bucket_field_name(upper_bound: f64) -> String {
    if upper_bound.is_infinite() {
        "le_inf".to_string()
    } else {
        format!("le_{}", upper_bound)
    }
}

/// Encode one point: `measurement[,tag=v] field=v[,field=v] timestamp`.
fn encode_point(
    name: &str,
    metric: &Metric,
    fields: &[(String, f64)],
    timestamp_ns: i64,
) -> String {
    let mut line = escape_key(name);

    for label in metric.get_label() {
        line.push(',');
        line.push_str(&escape_key(label.get_name()));
        line.push('=');
        line.push_str(&escape_key(label.get_value()));
    }

    line.push(' ');
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&value.to_string());
    }

    line.push(' ');
    line.push_str(&timestamp_ns.to_string());
    line
}

/// Escape measurement names, tag keys/values and field keys.
fn escape_key(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == ',' || c == '=' || c == ' ' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
