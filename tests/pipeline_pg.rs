//! End-to-end pipeline scenarios against a live Postgres.
//!
//! Run with:
//! ```sh
//! DATABASE_URL=postgres://... cargo test --features integration-pg
//! ```
//!
//! The scenarios share one database and one schedulable set, so every test
//! serializes on a binary-wide lock; fixtures still use unique names in
//! case rows survive a crashed run.

#![cfg(feature = "integration-pg")]

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use domainwatch::config::{ResolverConfig, RetentionConfig};
use domainwatch::scheduler::run_resolution_task;
use domainwatch::store::Domain;
use domainwatch::{IngestServer, Metrics, RetentionEngine, Store};

use common::*;

static PIPELINE_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn resolver_cfg(workers: usize, max_resolv: i32, cyclic: bool) -> ResolverConfig {
    ResolverConfig {
        interval_seconds: 1,
        max_resolv,
        timeout_seconds: 5,
        workers,
        cyclic_resolv: cyclic,
        resolv_cooldown_mins: 0,
    }
}

async fn fetch_domain_by_name(store: &Store, name: &str) -> Option<Domain> {
    sqlx::query_as::<_, Domain>(
        "SELECT id, domain, first_seen, last_seen, resolv_count, max_resolv, last_resolv_time FROM domain WHERE domain = $1",
    )
    .bind(name)
    .fetch_optional(store.pool())
    .await
    .expect("failed to query domain")
}

/// Start an ingest server on a free local port.
async fn start_ingest(store: Store, metrics: Arc<Metrics>) -> (u16, CancellationToken) {
    let port = {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").expect("failed to probe for a port");
        probe.local_addr().unwrap().port()
    };

    let server = IngestServer::new(port, 5, store, metrics);
    let stop = CancellationToken::new();
    let token = stop.clone();
    tokio::spawn(async move {
        let _ = server.run(token).await;
    });

    // Give the socket a moment to bind.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    (port, stop)
}

async fn send_datagram(port: u16, payload: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(payload, ("127.0.0.1", port))
        .await
        .expect("failed to send datagram");
}

async fn wait_for_domain(store: &Store, name: &str) -> Domain {
    for _ in 0..50 {
        if let Some(domain) = fetch_domain_by_name(store, name).await {
            return domain;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("domain '{}' was never registered", name);
}

#[tokio::test]
async fn first_sighting_registers_domain_and_stat() {
    let _guard = PIPELINE_LOCK.lock().await;
    let store = test_store().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let (port, stop) = start_ingest(store.clone(), metrics.clone()).await;

    let name = unique_name("sighting");
    let payload = format!(
        r#"{{"client_ip":"10.0.0.5","domain":"{}","qtype":"A","rtype":"A"}}"#,
        name
    );
    send_datagram(port, payload.as_bytes()).await;

    let domain = wait_for_domain(&store, &name).await;
    assert_eq!(domain.resolv_count, 0);
    assert_eq!(domain.max_resolv, 5);

    let stats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM domain_stat WHERE domain = $1")
        .bind(&name)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(stats, 1);

    assert_eq!(
        metrics
            .server_messages_received
            .with_label_values(&["valid"])
            .get(),
        1
    );
    assert_eq!(metrics.server_new_domains.get(), 1);
    assert_eq!(
        metrics
            .server_domains_received
            .with_label_values(&["A"])
            .get(),
        1
    );

    stop.cancel();
}

#[tokio::test]
async fn garbage_suffix_datagram_is_recovered() {
    let _guard = PIPELINE_LOCK.lock().await;
    let store = test_store().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let (port, stop) = start_ingest(store.clone(), metrics.clone()).await;

    let name = unique_name("garbage");
    let payload = format!(
        r#"{{"client_ip":"192.168.0.50","domain":"{}","qtype":"A","rtype":"cache"}}e"}}"#,
        name
    );
    send_datagram(port, payload.as_bytes()).await;

    let domain = wait_for_domain(&store, &name).await;
    assert_eq!(domain.resolv_count, 0);

    assert_eq!(
        metrics
            .server_messages_received
            .with_label_values(&["valid"])
            .get(),
        1
    );
    assert_eq!(
        metrics
            .server_messages_received
            .with_label_values(&["invalid"])
            .get(),
        0
    );

    stop.cancel();
}

#[tokio::test]
async fn invalid_datagram_is_counted_and_discarded() {
    let _guard = PIPELINE_LOCK.lock().await;
    let store = test_store().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let (port, stop) = start_ingest(store.clone(), metrics.clone()).await;

    send_datagram(port, b"definitely not json").await;

    for _ in 0..50 {
        if metrics
            .server_messages_received
            .with_label_values(&["invalid"])
            .get()
            == 1
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert_eq!(
        metrics
            .server_messages_received
            .with_label_values(&["invalid"])
            .get(),
        1
    );
    assert_eq!(
        metrics
            .server_messages_received
            .with_label_values(&["valid"])
            .get(),
        0
    );

    stop.cancel();
}

#[tokio::test]
async fn one_shot_cycle_resolves_budget_times() {
    let _guard = PIPELINE_LOCK.lock().await;
    let store = test_store().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let lookups = Arc::new(StubLookups::answering());

    let name = unique_name("oneshot-task");
    store.upsert_domain(&name, 3).await.unwrap();

    // Large worker count widens the batch so leftover rows in a shared
    // test database cannot crowd the fixture out of selection.
    let cfg = resolver_cfg(25, 3, false);
    for _ in 0..3 {
        run_resolution_task(store.clone(), metrics.clone(), lookups.clone(), cfg.clone()).await;
    }

    let domain = fetch_domain_by_name(&store, &name).await.unwrap();
    assert_eq!(domain.resolv_count, 3);

    let kinds: Vec<String> = sqlx::query_scalar("SELECT type FROM ip WHERE domain_id = $1 ORDER BY type")
        .bind(domain.id)
        .fetch_all(store.pool())
        .await
        .unwrap();
    assert_eq!(kinds, vec!["ipv4".to_string(), "ipv6".to_string()]);

    assert!(
        metrics
            .resolver_domains_processed
            .with_label_values(&["success"])
            .get()
            >= 3
    );
}

#[tokio::test]
async fn cyclic_cycle_resets_counter_with_fresh_stamp() {
    let _guard = PIPELINE_LOCK.lock().await;
    let store = test_store().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let lookups = Arc::new(StubLookups::answering());

    let name = unique_name("cyclic-task");
    store.upsert_domain(&name, 6).await.unwrap();
    let before = fetch_domain_by_name(&store, &name).await.unwrap();

    let cfg = resolver_cfg(25, 6, true);
    for _ in 0..6 {
        run_resolution_task(store.clone(), metrics.clone(), lookups.clone(), cfg.clone()).await;
    }

    let after = fetch_domain_by_name(&store, &name).await.unwrap();
    assert_eq!(after.resolv_count, 4, "sixth resolution resets to floor(6*2/3)");
    assert!(after.last_resolv_time > before.last_resolv_time);
}

#[tokio::test]
async fn failed_lookups_still_advance_the_schedule() {
    let _guard = PIPELINE_LOCK.lock().await;
    let store = test_store().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let lookups = Arc::new(StubLookups::failing());

    let name = unique_name("failing-task");
    store.upsert_domain(&name, 3).await.unwrap();

    let cfg = resolver_cfg(25, 3, false);
    run_resolution_task(store.clone(), metrics.clone(), lookups.clone(), cfg).await;

    let domain = fetch_domain_by_name(&store, &name).await.unwrap();
    assert_eq!(domain.resolv_count, 1, "bump happens despite lookup errors");

    let ips: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ip WHERE domain_id = $1")
        .bind(domain.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ips, 0);

    assert!(
        metrics
            .resolver_domains_processed
            .with_label_values(&["no_results"])
            .get()
            >= 1
    );
}

#[tokio::test]
async fn retention_run_cascades_expired_domain() {
    let _guard = PIPELINE_LOCK.lock().await;
    let store = test_store().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let now = Utc::now();

    let name = unique_name("retention-cascade");
    let id = insert_domain_at(&store, &name, 5, 0, now - ChronoDuration::days(2), now).await;
    for _ in 0..3 {
        insert_ip_at(&store, id, &unique_ipv4(), now).await;
    }

    let cfg = RetentionConfig {
        stats_days: 30,
        cleanup_interval_hours: 24,
        ip_ttl_days: 3,
        domain_ttl_days: 1,
    };
    let engine = RetentionEngine::new(cfg, store.clone(), metrics.clone());
    engine.run_once().await;

    assert!(fetch_domain_by_name(&store, &name).await.is_none());
    let ips: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ip WHERE domain_id = $1")
        .bind(id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ips, 0);

    assert!(metrics.cleanup_domains_deleted.get() >= 1);
    assert!(metrics.cleanup_domain_ips_deleted.get() >= 3);
    assert_eq!(metrics.cleanup_runs.get(), 1);
}

#[tokio::test]
async fn disabled_ttls_leave_expired_rows_alone() {
    let _guard = PIPELINE_LOCK.lock().await;
    let store = test_store().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let now = Utc::now();

    let name = unique_name("retention-disabled");
    let id = insert_domain_at(&store, &name, 5, 0, now - ChronoDuration::days(2), now).await;
    insert_ip_at(&store, id, &unique_ipv4(), now - ChronoDuration::days(10)).await;

    let cfg = RetentionConfig {
        stats_days: 30,
        cleanup_interval_hours: 24,
        ip_ttl_days: 0,
        domain_ttl_days: 0,
    };
    let engine = RetentionEngine::new(cfg, store.clone(), metrics.clone());
    engine.run_once().await;

    assert!(fetch_domain_by_name(&store, &name).await.is_some());
    let ips: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ip WHERE domain_id = $1")
        .bind(id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ips, 1);
    assert_eq!(metrics.cleanup_ips_deleted.get(), 0);
    assert_eq!(metrics.cleanup_domains_deleted.get(), 0);

    // Remove the backdated fixture so other tests' retention runs cannot
    // observe it.
    sqlx::query("DELETE FROM domain WHERE id = $1")
        .bind(id)
        .execute(store.pool())
        .await
        .unwrap();
}
