//! Shared infrastructure for the Postgres-backed integration tests.
//!
//! Tests share one database (from `DATABASE_URL`) and run concurrently, so
//! every fixture uses a process-unique name and fresh timestamps unless a
//! test deliberately backdates rows to trigger retention.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hickory_resolver::error::ResolveError;
use sqlx::postgres::PgPoolOptions;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};

use domainwatch::scheduler::DnsLookups;
use domainwatch::store::Store;

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Connect to the test database and bring the schema up to date.
pub async fn test_store() -> Store {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for the integration-pg suite");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to the test database");

    let store = Store::from_pool(pool);
    store.migrate().await.expect("failed to run migrations");
    store
}

/// A domain name no other concurrently running test will touch.
pub fn unique_name(prefix: &str) -> String {
    format!(
        "{}-{}-{}.test",
        prefix,
        std::process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Insert a domain row with explicit timestamps, bypassing the upsert
/// path. Returns the row ID.
pub async fn insert_domain_at(
    store: &Store,
    name: &str,
    max_resolv: i32,
    resolv_count: i32,
    last_seen: DateTime<Utc>,
    last_resolv_time: DateTime<Utc>,
) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO domain (domain, first_seen, last_seen, resolv_count, max_resolv, last_resolv_time)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(last_seen - Duration::days(1))
    .bind(last_seen)
    .bind(resolv_count)
    .bind(max_resolv)
    .bind(last_resolv_time)
    .fetch_one(store.pool())
    .await
    .expect("failed to insert fixture domain")
}

/// Backdate an IP row under a domain.
pub async fn insert_ip_at(store: &Store, domain_id: i64, ip: &str, observed: DateTime<Utc>) {
    sqlx::query("INSERT INTO ip (domain_id, ip, type, observed_time) VALUES ($1, $2, 'ipv4', $3)")
        .bind(domain_id)
        .bind(ip)
        .bind(observed)
        .execute(store.pool())
        .await
        .expect("failed to insert fixture IP");
}

/// An IPv4 address no other concurrently running test will use.
pub fn unique_ipv4() -> String {
    let n = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() as u64;
    format!("10.{}.{}.{}", pid % 200 + 1, (n >> 8) % 256, n % 256)
}

/// Fixture resolver returning canned answers.
pub struct StubLookups {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    pub fail: bool,
}

impl StubLookups {
    /// One A and one AAAA answer for every name.
    pub fn answering() -> Self {
        Self {
            ipv4: vec![Ipv4Addr::new(93, 184, 216, 34)],
            ipv6: vec!["2606:2800:220:1::1".parse().unwrap()],
            fail: false,
        }
    }

    /// Every lookup fails.
    pub fn failing() -> Self {
        Self {
            ipv4: Vec::new(),
            ipv6: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl DnsLookups for StubLookups {
    async fn lookup_ipv4(&self, _domain: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        if self.fail {
            return Err(ResolveError::from("stub lookup failure"));
        }
        Ok(self.ipv4.clone())
    }

    async fn lookup_ipv6(&self, _domain: &str) -> Result<Vec<Ipv6Addr>, ResolveError> {
        if self.fail {
            return Err(ResolveError::from("stub lookup failure"));
        }
        Ok(self.ipv6.clone())
    }
}
