//! Retention engine.
//!
//! A periodic deleter that bounds the store: old query events, expired
//! addresses, and finally expired domains (with their addresses, in one
//! transaction). The three passes run strictly in order; a failed pass is
//! logged and the run continues.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::error::CollectorError;
use crate::metrics::{Metrics, Timer};
use crate::store::Store;

/// Periodic store cleanup.
pub struct RetentionEngine {
    cfg: RetentionConfig,
    store: Store,
    metrics: Arc<Metrics>,
}

impl RetentionEngine {
    /// Create a new retention engine.
    pub fn new(cfg: RetentionConfig, store: Store, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            store,
            metrics,
        }
    }

    /// Run one cleanup immediately, then once per configured interval,
    /// until shutdown.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        info!(
            stats_days = self.cfg.stats_days,
            ip_ttl_days = self.cfg.ip_ttl_days,
            domain_ttl_days = self.cfg.domain_ttl_days,
            interval_hours = self.cfg.cleanup_interval_hours,
            "retention engine started"
        );

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.cleanup_interval_hours * 3600));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.cancelled() => {
                    info!("retention engine stopped");
                    return Ok(());
                }
            }
        }
    }

    /// One retention run: stats, expired IPs, expired domains.
    pub async fn run_once(&self) {
        let timer = Timer::start();
        self.metrics.cleanup_runs.inc();
        info!("running cleanup");

        let stats_cutoff = Utc::now() - ChronoDuration::days(self.cfg.stats_days);
        match self.store.delete_stats_before(stats_cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(deleted, "removed old stat records");
                }
                self.metrics.cleanup_stats_deleted.inc_by(deleted);
            }
            Err(e) => warn!("error during stats cleanup: {}", e),
        }

        // A disabled TTL (0) skips the pass entirely.
        if self.cfg.ip_ttl_days > 0 {
            let ip_cutoff = Utc::now() - ChronoDuration::days(self.cfg.ip_ttl_days);
            // Leave addresses of soon-to-expire domains to the cascade in
            // the next pass, so their deletion is counted there.
            let active_floor = (self.cfg.domain_ttl_days > 0)
                .then(|| Utc::now() - ChronoDuration::days(self.cfg.domain_ttl_days));

            match self.store.delete_expired_ips(ip_cutoff, active_floor).await {
                Ok(deleted) => {
                    if deleted > 0 {
                        info!(deleted, "removed expired IP addresses");
                    }
                    self.metrics.cleanup_ips_deleted.inc_by(deleted);
                }
                Err(e) => warn!("error during IP cleanup: {}", e),
            }
        }

        if self.cfg.domain_ttl_days > 0 {
            let domain_cutoff = Utc::now() - ChronoDuration::days(self.cfg.domain_ttl_days);
            match self.store.delete_expired_domains(domain_cutoff).await {
                Ok((domains, ips)) => {
                    if domains > 0 {
                        info!(domains, ips, "removed expired domains");
                    }
                    self.metrics.cleanup_domains_deleted.inc_by(domains);
                    self.metrics.cleanup_domain_ips_deleted.inc_by(ips);
                }
                Err(e) => warn!("error during domain cleanup: {}", e),
            }
        }

        self.metrics.cleanup_duration.observe(timer.elapsed_secs());
        info!("cleanup completed");
    }
}
