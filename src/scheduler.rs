//! Resolution scheduler.
//!
//! A periodic coordinator that selects a batch of due domains, fans them
//! out to a fixed-size worker pool over an MPMC channel, and records the
//! outcome of every lookup. Ticks may overlap when a task outlasts the
//! interval; the interval is expected to be chosen larger than typical
//! task duration.

use async_trait::async_trait;
use futures::future::join_all;
use hickory_resolver::error::ResolveError;
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::error::CollectorError;
use crate::metrics::{Metrics, Timer};
use crate::store::{Domain, IpKind, Store};

/// Hard cap on one batch, sized to the store pool (25 connections x 10).
const MAX_BATCH: i64 = 250;

/// Batch size for one resolution task.
pub fn compute_batch(workers: usize) -> i64 {
    ((workers as i64) * 10).min(MAX_BATCH)
}

/// Address lookups the workers perform. The production implementation
/// delegates to the host's stub resolver; tests substitute a fixture.
#[async_trait]
pub trait DnsLookups: Send + Sync + 'static {
    /// Look up A records for a domain.
    async fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, ResolveError>;

    /// Look up AAAA records for a domain.
    async fn lookup_ipv6(&self, domain: &str) -> Result<Vec<Ipv6Addr>, ResolveError>;
}

/// System-configured resolver backing the production scheduler.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    /// Build a resolver from the host configuration with the given
    /// per-attempt timeout.
    pub fn from_system_conf(timeout: Duration) -> Result<Self, ResolveError> {
        let (config, mut opts) = read_system_conf()?;
        opts.timeout = timeout;
        opts.attempts = 2;
        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

#[async_trait]
impl DnsLookups for SystemResolver {
    async fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let lookup = self.resolver.ipv4_lookup(domain).await?;
        Ok(lookup.iter().map(|a| a.0).collect())
    }

    async fn lookup_ipv6(&self, domain: &str) -> Result<Vec<Ipv6Addr>, ResolveError> {
        let lookup = self.resolver.ipv6_lookup(domain).await?;
        Ok(lookup.iter().map(|aaaa| aaaa.0).collect())
    }
}

/// Periodic resolution coordinator.
pub struct ResolutionScheduler<L> {
    cfg: ResolverConfig,
    store: Store,
    metrics: Arc<Metrics>,
    lookups: Arc<L>,
}

impl<L: DnsLookups> ResolutionScheduler<L> {
    /// Create a new scheduler.
    pub fn new(cfg: ResolverConfig, store: Store, metrics: Arc<Metrics>, lookups: Arc<L>) -> Self {
        Self {
            cfg,
            store,
            metrics,
            lookups,
        }
    }

    /// Tick until shutdown, spawning one resolution task per tick (the
    /// first fires immediately), then drain in-flight tasks.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        let interval = Duration::from_secs(self.cfg.interval_seconds);
        info!(?interval, workers = self.cfg.workers, "resolution scheduler started");

        let mut ticker = tokio::time::interval(interval);
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    let store = self.store.clone();
                    let metrics = self.metrics.clone();
                    let lookups = self.lookups.clone();
                    let cfg = self.cfg.clone();
                    tracker.spawn(async move {
                        run_resolution_task(store, metrics, lookups, cfg).await;
                    });
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("resolution scheduler stopped");
        Ok(())
    }
}

/// One resolution task: select a batch, drain it with the worker pool,
/// wait for every worker before returning.
pub async fn run_resolution_task<L: DnsLookups>(
    store: Store,
    metrics: Arc<Metrics>,
    lookups: Arc<L>,
    cfg: ResolverConfig,
) {
    debug!("starting resolution task");

    let batch = compute_batch(cfg.workers);
    let domains = match store
        .select_due(batch, cfg.cyclic_resolv, cfg.resolv_cooldown_mins)
        .await
    {
        Ok(domains) => domains,
        Err(e) => {
            warn!("error selecting domains to resolve: {}", e);
            return;
        }
    };

    if domains.is_empty() {
        debug!("no domains due for resolution");
        return;
    }

    info!(count = domains.len(), "resolving batch");
    metrics.resolver_batch_size.set(domains.len() as i64);

    let (tx, rx) = async_channel::bounded::<Domain>(domains.len());
    for domain in domains {
        // Channel is sized for the batch; send cannot block here.
        let _ = tx.send(domain).await;
    }
    drop(tx);

    let deadline = Duration::from_secs(cfg.timeout_seconds);
    let cyclic = cfg.cyclic_resolv;
    let workers = (0..cfg.workers).map(|id| {
        let rx = rx.clone();
        let store = store.clone();
        let metrics = metrics.clone();
        let lookups = lookups.clone();
        tokio::spawn(async move {
            worker(id + 1, rx, store, metrics, lookups, deadline, cyclic).await;
        })
    });
    join_all(workers).await;

    metrics.resolver_batch_size.set(0);
    debug!("resolution task completed");
}

/// Drain the batch channel, resolving one domain at a time.
async fn worker<L: DnsLookups>(
    id: usize,
    rx: async_channel::Receiver<Domain>,
    store: Store,
    metrics: Arc<Metrics>,
    lookups: Arc<L>,
    deadline: Duration,
    cyclic: bool,
) {
    metrics.resolver_active_workers.inc();

    while let Ok(domain) = rx.recv().await {
        debug!(worker = id, domain = %domain.domain, "resolving");
        resolve_domain(&store, &metrics, lookups.as_ref(), deadline, cyclic, &domain).await;
    }

    metrics.resolver_active_workers.dec();
}

/// Resolve both address families for one domain and record the outcome.
///
/// The two lookups are independent: a failure on one family neither
/// suppresses the other nor the stats update, so non-resolvable names
/// keep advancing through the schedule instead of starving it.
async fn resolve_domain<L: DnsLookups>(
    store: &Store,
    metrics: &Metrics,
    lookups: &L,
    deadline: Duration,
    cyclic: bool,
    domain: &Domain,
) {
    let mut has_results = false;

    let timer = Timer::start();
    let ipv4 = tokio::time::timeout(deadline, lookups.lookup_ipv4(&domain.domain)).await;
    metrics
        .resolver_lookup_duration
        .with_label_values(&["ipv4"])
        .observe(timer.elapsed_secs());
    match ipv4 {
        Ok(Ok(addrs)) => {
            metrics
                .resolver_lookups
                .with_label_values(&["ipv4", "success"])
                .inc();
            for addr in addrs {
                match store.upsert_ip(domain.id, &addr.to_string(), IpKind::V4).await {
                    Ok(()) => {
                        debug!(domain = %domain.domain, ip = %addr, "resolved IPv4");
                        has_results = true;
                    }
                    Err(e) => {
                        warn!(domain = %domain.domain, ip = %addr, "error storing IPv4: {}", e)
                    }
                }
            }
        }
        Ok(Err(e)) => {
            debug!(domain = %domain.domain, "IPv4 lookup failed: {}", e);
            metrics
                .resolver_lookups
                .with_label_values(&["ipv4", "error"])
                .inc();
        }
        Err(_) => {
            debug!(domain = %domain.domain, "IPv4 lookup deadline exceeded");
            metrics
                .resolver_lookups
                .with_label_values(&["ipv4", "error"])
                .inc();
        }
    }

    let timer = Timer::start();
    let ipv6 = tokio::time::timeout(deadline, lookups.lookup_ipv6(&domain.domain)).await;
    metrics
        .resolver_lookup_duration
        .with_label_values(&["ipv6"])
        .observe(timer.elapsed_secs());
    match ipv6 {
        Ok(Ok(addrs)) => {
            metrics
                .resolver_lookups
                .with_label_values(&["ipv6", "success"])
                .inc();
            for addr in addrs {
                match store.upsert_ip(domain.id, &addr.to_string(), IpKind::V6).await {
                    Ok(()) => {
                        debug!(domain = %domain.domain, ip = %addr, "resolved IPv6");
                        has_results = true;
                    }
                    Err(e) => {
                        warn!(domain = %domain.domain, ip = %addr, "error storing IPv6: {}", e)
                    }
                }
            }
        }
        Ok(Err(e)) => {
            debug!(domain = %domain.domain, "IPv6 lookup failed: {}", e);
            metrics
                .resolver_lookups
                .with_label_values(&["ipv6", "error"])
                .inc();
        }
        Err(_) => {
            debug!(domain = %domain.domain, "IPv6 lookup deadline exceeded");
            metrics
                .resolver_lookups
                .with_label_values(&["ipv6", "error"])
                .inc();
        }
    }

    // Advance the schedule whether or not anything resolved, so dead
    // domains cannot pin themselves to the front of the queue.
    if let Err(e) = store.bump_resolv(domain.id, cyclic).await {
        warn!(domain = %domain.domain, "error updating resolution stats: {}", e);
    }

    let status = if has_results { "success" } else { "no_results" };
    if !has_results {
        debug!(domain = %domain.domain, "no addresses resolved");
    }
    metrics
        .resolver_domains_processed
        .with_label_values(&[status])
        .inc();
}
