//! domainwatch - a DNS observability pipeline.
//!
//! This crate ingests DNS-query events emitted by recursive resolvers over
//! a lossy UDP channel, registers each observed domain once in Postgres,
//! periodically re-resolves the tracked domains' IPv4/IPv6 addresses, and
//! exposes the accumulated inventory through plain-text export endpoints.
//!
//! ## Features
//!
//! - Resilient datagram decoding (recovers payloads with trailing garbage)
//! - Fair, bounded, optionally cyclic re-resolution with a worker pool
//! - TTL-based retention with referential integrity across tables
//! - Regex-driven export lists with a shared-IP exclusion join
//! - Prometheus exposition plus an optional InfluxDB push client
//! - Graceful shutdown draining every component's in-flight work
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          domainwatch                             │
//! │                                                                  │
//! │  resolvers ──UDP──▶ ┌──────────┐        ┌─────────────────┐      │
//! │                     │  ingest  │───────▶│                 │      │
//! │                     └──────────┘        │                 │      │
//! │                     ┌──────────┐        │    Postgres     │      │
//! │   stub resolver ◀──▶│ scheduler│◀──────▶│  domain / ip /  │      │
//! │                     └──────────┘        │   domain_stat   │      │
//! │                     ┌──────────┐        │                 │      │
//! │                     │ retention│───────▶│                 │      │
//! │                     └──────────┘        └────────┬────────┘      │
//! │                     ┌──────────┐                 │               │
//! │      curators ◀─────│  export  │◀────────────────┘               │
//! │                     └──────────┘                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Components communicate only through the store; the single piece of
//! process-wide mutable state outside it is the active-worker gauge.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use domainwatch::{IngestServer, Metrics, Store};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Store::connect(&store_cfg).await.unwrap();
//!     store.migrate().await.unwrap();
//!
//!     let metrics = Arc::new(Metrics::new().unwrap());
//!     let shutdown = CancellationToken::new();
//!
//!     let server = IngestServer::new(5300, 5, store, metrics);
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod export;
pub mod influx;
pub mod ingest;
pub mod metrics;
pub mod retention;
pub mod scheduler;
pub mod store;

// Re-export main types
pub use config::Config;
pub use error::CollectorError;
pub use ingest::IngestServer;
pub use metrics::Metrics;
pub use retention::RetentionEngine;
pub use scheduler::ResolutionScheduler;
pub use store::Store;
