//! Error types for domainwatch.

use thiserror::Error;

/// Errors that can occur in the collector pipeline.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// IO error (socket, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Store query or connection error
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Schema migration failure (a dirty migration state is fatal)
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// DNS resolver setup error
    #[error("resolver error: {0}")]
    Resolver(#[from] hickory_resolver::error::ResolveError),

    /// Metrics collector registration error
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metrics push sink error
    #[error("push sink error: {0}")]
    Push(#[from] reqwest::Error),
}
