//! Configuration types for domainwatch.
//!
//! The document is loaded from TOML by the binary, then normalized by
//! [`Config::validate`], which applies defaults for out-of-range optional
//! values and rejects anything fatal (bad ports, impossible retention
//! windows, malformed export regexes).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CollectorError;
use crate::export;

/// Directory export lists may read additional IP files from.
pub const ALLOWED_IPS_FILE_ROOT: &str = "/etc/domainwatch";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// UDP ingest server configuration.
    pub server: ServerConfig,

    /// Relational store configuration.
    pub store: StoreConfig,

    /// Resolution scheduler configuration.
    pub resolver: ResolverConfig,

    /// Retention engine configuration.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Metrics exposition and push configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// HTTP surface carrying export endpoints.
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Export list definitions.
    #[serde(default)]
    pub exports: Vec<ExportListConfig>,
}

/// UDP ingest server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the ingest socket binds on 0.0.0.0.
    pub udp_port: u16,
}

/// Relational store connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host.
    pub host: String,

    /// Store port.
    #[serde(default = "default_store_port")]
    pub port: u16,

    /// Role to connect as.
    pub user: String,

    /// Password; overridable via `POSTGRES_PASSWORD`.
    #[serde(default)]
    pub password: String,

    /// Database name.
    pub database: String,

    /// SSL mode (`disable`, `prefer`, `require`); overridable via
    /// `POSTGRES_SSL_MODE`.
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

/// Resolution scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Seconds between resolution tasks.
    pub interval_seconds: u64,

    /// Per-domain resolution budget for one cycle.
    pub max_resolv: i32,

    /// Hard deadline for a single lookup, in seconds.
    #[serde(default = "default_lookup_timeout")]
    pub timeout_seconds: u64,

    /// Worker pool size; values below 1 are coerced to 1.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// When true, a domain that finishes its cycle is recycled instead of
    /// retired.
    #[serde(default)]
    pub cyclic_resolv: bool,

    /// Minimum minutes between the end of a cycle and re-selection.
    #[serde(default)]
    pub resolv_cooldown_mins: i64,
}

/// Retention engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days of `domain_stat` history to keep (1..=365).
    #[serde(default = "default_stats_days")]
    pub stats_days: i64,

    /// Hours between cleanup runs (1..=168).
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,

    /// Days an IP row may go unrefreshed before expiry (0 disables, max 90).
    #[serde(default = "default_ip_ttl_days")]
    pub ip_ttl_days: i64,

    /// Days a domain may go unseen before expiry (0 disables, max 365).
    #[serde(default)]
    pub domain_ttl_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            stats_days: default_stats_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            ip_ttl_days: default_ip_ttl_days(),
            domain_ttl_days: 0,
        }
    }
}

/// Metrics exposition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Master switch for the scrape endpoint and push client.
    #[serde(default)]
    pub enabled: bool,

    /// Scrape listener port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Scrape path.
    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// Optional push client towards a time-series database.
    #[serde(default)]
    pub push: PushConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
            push: PushConfig::default(),
        }
    }
}

/// InfluxDB push client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushConfig {
    /// Enable the periodic push.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the InfluxDB instance.
    #[serde(default)]
    pub url: String,

    /// API token; overridable via `INFLUXDB_TOKEN`.
    #[serde(default)]
    pub token: String,

    /// Organization name.
    #[serde(default)]
    pub organization: String,

    /// Destination bucket.
    #[serde(default)]
    pub bucket: String,

    /// Seconds between pushes.
    #[serde(default)]
    pub interval_seconds: u64,

    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// HTTP surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listener port for export endpoints and `/health`.
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "domainwatch=debug,warn").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One export list: a regex-parameterized projection of the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportListConfig {
    /// Unique list name, used in logs and validation messages.
    pub name: String,

    /// Endpoint path the plain-text projection is served on.
    pub endpoint: String,

    /// Regex selecting the domains of this list.
    pub domain_regex: String,

    /// Emit matching domain names.
    #[serde(default = "default_true")]
    pub include_domains: bool,

    /// Emit IPv4 addresses of matching domains.
    #[serde(default = "default_true")]
    pub include_ipv4: bool,

    /// Emit IPv6 addresses of matching domains.
    #[serde(default = "default_true")]
    pub include_ipv6: bool,

    /// Suppress addresses also owned by non-matching domains.
    #[serde(default)]
    pub exclude_shared_ips: bool,

    /// Optional endpoint exposing the excluded-IP diagnostic as JSON.
    #[serde(default)]
    pub excluded_ips_endpoint: Option<String>,

    /// Optional file of extra addresses appended to the projection.
    /// Must be an absolute path under [`ALLOWED_IPS_FILE_ROOT`].
    #[serde(default)]
    pub additional_ips_file: Option<String>,
}

fn default_store_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_lookup_timeout() -> u64 {
    5
}

fn default_workers() -> usize {
    1
}

fn default_stats_days() -> i64 {
    30
}

fn default_cleanup_interval_hours() -> u64 {
    24
}

fn default_ip_ttl_days() -> i64 {
    3
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Apply the environment overrides recognized by the deployment:
    /// `POSTGRES_PASSWORD`, `POSTGRES_SSL_MODE` and `INFLUXDB_TOKEN`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var("POSTGRES_PASSWORD") {
            if !password.is_empty() {
                self.store.password = password;
            }
        }
        if let Ok(ssl_mode) = std::env::var("POSTGRES_SSL_MODE") {
            if !ssl_mode.is_empty() {
                self.store.ssl_mode = ssl_mode;
            }
        }
        if let Ok(token) = std::env::var("INFLUXDB_TOKEN") {
            if !token.is_empty() {
                self.metrics.push.token = token;
            }
        }
    }

    /// Validate the document, coercing soft values and rejecting fatal ones.
    pub fn validate(&mut self) -> Result<(), CollectorError> {
        if self.server.udp_port == 0 {
            return Err(CollectorError::Config(format!(
                "invalid UDP port: {}",
                self.server.udp_port
            )));
        }

        if self.resolver.interval_seconds == 0 {
            return Err(CollectorError::Config(format!(
                "invalid resolver interval: {}",
                self.resolver.interval_seconds
            )));
        }
        if self.resolver.max_resolv <= 0 {
            return Err(CollectorError::Config(format!(
                "invalid max_resolv: {}",
                self.resolver.max_resolv
            )));
        }
        if self.resolver.workers == 0 {
            self.resolver.workers = 1;
        }
        if self.resolver.timeout_seconds == 0 {
            self.resolver.timeout_seconds = default_lookup_timeout();
        }
        if self.resolver.cyclic_resolv && self.resolver.resolv_cooldown_mins <= 0 {
            // 4 hours between cycles unless the operator says otherwise.
            self.resolver.resolv_cooldown_mins = 240;
        }

        if self.retention.stats_days <= 0 {
            self.retention.stats_days = default_stats_days();
        }
        if self.retention.stats_days > 365 {
            return Err(CollectorError::Config(format!(
                "retention stats_days must not exceed 365, got {}",
                self.retention.stats_days
            )));
        }
        if self.retention.cleanup_interval_hours == 0 {
            self.retention.cleanup_interval_hours = default_cleanup_interval_hours();
        }
        if self.retention.cleanup_interval_hours > 168 {
            return Err(CollectorError::Config(format!(
                "retention cleanup_interval_hours must not exceed 168, got {}",
                self.retention.cleanup_interval_hours
            )));
        }
        if self.retention.ip_ttl_days < 0 {
            self.retention.ip_ttl_days = 0;
        }
        if self.retention.ip_ttl_days > 90 {
            return Err(CollectorError::Config(format!(
                "retention ip_ttl_days must not exceed 90, got {}",
                self.retention.ip_ttl_days
            )));
        }
        if self.retention.domain_ttl_days < 0 {
            self.retention.domain_ttl_days = 0;
        }
        if self.retention.domain_ttl_days > 365 {
            return Err(CollectorError::Config(format!(
                "retention domain_ttl_days must not exceed 365, got {}",
                self.retention.domain_ttl_days
            )));
        }

        if self.metrics.path.is_empty() {
            self.metrics.path = default_metrics_path();
        }
        if self.metrics.push.interval_seconds == 0 {
            self.metrics.push.interval_seconds = 10;
        }

        self.validate_exports()
    }

    fn validate_exports(&self) -> Result<(), CollectorError> {
        let mut names = std::collections::HashSet::new();
        let mut endpoints = std::collections::HashSet::new();

        for list in &self.exports {
            if list.name.is_empty() {
                return Err(CollectorError::Config(
                    "export list name is required".to_string(),
                ));
            }
            if !names.insert(list.name.as_str()) {
                return Err(CollectorError::Config(format!(
                    "duplicate export list name '{}'",
                    list.name
                )));
            }

            if !list.endpoint.starts_with('/') {
                return Err(CollectorError::Config(format!(
                    "export list '{}': endpoint must start with '/'",
                    list.name
                )));
            }
            if !endpoints.insert(list.endpoint.as_str()) {
                return Err(CollectorError::Config(format!(
                    "export list '{}': endpoint '{}' conflicts with another endpoint",
                    list.name, list.endpoint
                )));
            }

            if list.domain_regex.is_empty() {
                return Err(CollectorError::Config(format!(
                    "export list '{}': domain_regex is required",
                    list.name
                )));
            }
            export::validate_pattern(&list.domain_regex).map_err(|e| {
                CollectorError::Config(format!("export list '{}': {}", list.name, e))
            })?;

            if let Some(excluded) = &list.excluded_ips_endpoint {
                if !excluded.starts_with('/') {
                    return Err(CollectorError::Config(format!(
                        "export list '{}': excluded_ips_endpoint must start with '/'",
                        list.name
                    )));
                }
                if !endpoints.insert(excluded.as_str()) {
                    return Err(CollectorError::Config(format!(
                        "export list '{}': excluded_ips_endpoint '{}' conflicts with another endpoint",
                        list.name, excluded
                    )));
                }
                if !list.exclude_shared_ips {
                    tracing::warn!(
                        list = %list.name,
                        "excluded_ips_endpoint configured but exclude_shared_ips is false"
                    );
                }
            }

            if list.exclude_shared_ips && !list.include_ipv4 && !list.include_ipv6 {
                tracing::warn!(
                    list = %list.name,
                    "exclude_shared_ips is set but no IP types are enabled"
                );
            }

            if let Some(file) = &list.additional_ips_file {
                let path = Path::new(file);
                if !path.is_absolute() {
                    return Err(CollectorError::Config(format!(
                        "export list '{}': additional_ips_file must be an absolute path",
                        list.name
                    )));
                }
                if !path.starts_with(ALLOWED_IPS_FILE_ROOT) {
                    return Err(CollectorError::Config(format!(
                        "export list '{}': additional_ips_file must be within {}",
                        list.name, ALLOWED_IPS_FILE_ROOT
                    )));
                }
            }
        }

        Ok(())
    }
}
