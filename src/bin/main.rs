//! domainwatch binary entry point.
//!
//! Boot order: config, store (with migrations), metrics, export surface,
//! ingest, scheduler, retention. Shutdown walks the components in reverse
//! start order, cancelling each one's token and waiting for it to drain.

use clap::Parser;
use domainwatch::influx::InfluxPush;
use domainwatch::scheduler::SystemResolver;
use domainwatch::{
    export, metrics, Config, IngestServer, Metrics, ResolutionScheduler, RetentionEngine, Store,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// DNS observability pipeline.
#[derive(Parser, Debug)]
#[command(name = "domainwatch")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "domainwatch.toml")]
    config: PathBuf,
}

/// A started component: its name, its stop token and its done handle.
struct Component {
    name: &'static str,
    stop: CancellationToken,
    done: JoinHandle<()>,
}

/// Components stop in reverse start order; each hop waits for the
/// component to drain its in-flight work.
struct Supervisor {
    components: Vec<Component>,
}

impl Supervisor {
    fn new() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    fn start<F>(&mut self, name: &'static str, run: impl FnOnce(CancellationToken) -> F)
    where
        F: std::future::Future<Output = Result<(), domainwatch::CollectorError>> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let fut = run(stop.clone());
        let done = tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!(component = name, "component error: {}", e);
            }
        });
        self.components.push(Component { name, stop, done });
    }

    async fn shutdown(self) {
        for component in self.components.into_iter().rev() {
            info!(component = component.name, "stopping");
            component.stop.cancel();
            if let Err(e) = component.done.await {
                error!(component = component.name, "component task panicked: {}", e);
            }
        }
    }
}

fn init_tracing(level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut cfg: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .build()?
        .try_deserialize()?;
    cfg.apply_env_overrides();
    cfg.validate()?;

    init_tracing(&cfg.logging.level);

    info!(
        config_file = %args.config.display(),
        udp_port = cfg.server.udp_port,
        "starting domainwatch"
    );

    // Open the store and bring the schema up to date before anything else
    // touches it.
    let store = Store::connect(&cfg.store).await?;
    store.migrate().await?;

    let metrics = Arc::new(Metrics::new()?);

    let mut supervisor = Supervisor::new();

    if cfg.metrics.enabled {
        let port = cfg.metrics.port;
        let path = cfg.metrics.path.clone();
        let scrape_metrics = metrics.clone();
        supervisor.start("metrics", move |stop| {
            metrics::serve_scrape(port, path, scrape_metrics, stop)
        });

        if cfg.metrics.push.enabled {
            let push = InfluxPush::new(cfg.metrics.push.clone(), metrics.clone())?;
            match push.check_health().await {
                Ok(()) => {
                    supervisor.start("influx-push", move |stop| push.run(stop));
                }
                Err(e) => warn!("push sink unreachable, metrics push disabled: {}", e),
            }
        }

        let gauge_store = store.clone();
        let gauge_metrics = metrics.clone();
        supervisor.start("db-gauges", move |stop| async move {
            metrics::run_db_gauges(gauge_store, gauge_metrics, stop).await;
            Ok(())
        });

        info!(port = cfg.metrics.port, "metrics enabled");
    }

    {
        let port = cfg.http.port;
        let lists = cfg.exports.clone();
        let export_store = store.clone();
        supervisor.start("export", move |stop| {
            export::serve(port, lists, export_store, stop)
        });
    }

    {
        let server = IngestServer::new(
            cfg.server.udp_port,
            cfg.resolver.max_resolv,
            store.clone(),
            metrics.clone(),
        );
        supervisor.start("ingest", move |stop| server.run(stop));
    }

    {
        let lookups = Arc::new(SystemResolver::from_system_conf(Duration::from_secs(
            cfg.resolver.timeout_seconds,
        ))?);
        let scheduler =
            ResolutionScheduler::new(cfg.resolver.clone(), store.clone(), metrics.clone(), lookups);
        supervisor.start("scheduler", move |stop| scheduler.run(stop));
    }

    {
        let retention = RetentionEngine::new(cfg.retention.clone(), store.clone(), metrics.clone());
        supervisor.start("retention", move |stop| retention.run(stop));
    }

    info!("domainwatch is running");
    wait_for_signal().await;

    info!("shutting down gracefully");
    supervisor.shutdown().await;
    store.close().await;

    info!("domainwatch shutdown complete");
    Ok(())
}
