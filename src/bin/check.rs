//! domainwatch-check: inspect the state of a collector database.
//!
//! A read-only operator tool that connects with the same configuration as
//! the collector and prints an inventory summary: domain and address
//! counts, resolution progress, and the most queried domains.

use clap::Parser;
use domainwatch::{Config, Store};
use std::path::PathBuf;

/// Inspect a domainwatch database.
#[derive(Parser, Debug)]
#[command(name = "domainwatch-check")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "domainwatch.toml")]
    config: PathBuf,

    /// How many top queried domains to list.
    #[arg(long, default_value_t = 10)]
    top: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut cfg: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .build()?
        .try_deserialize()?;
    cfg.apply_env_overrides();

    let store = Store::connect(&cfg.store).await?;
    let pool = store.pool();

    println!("=== Domains ===");
    let total_domains: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM domain")
        .fetch_one(pool)
        .await?;
    let fully_resolved: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM domain WHERE resolv_count >= max_resolv")
            .fetch_one(pool)
            .await?;
    println!("total:            {}", total_domains);
    println!("fully resolved:   {}", fully_resolved);
    println!("pending:          {}", total_domains - fully_resolved);

    println!();
    println!("=== Addresses ===");
    let total_ips: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ip")
        .fetch_one(pool)
        .await?;
    let ipv4: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ip WHERE type = 'ipv4'")
        .fetch_one(pool)
        .await?;
    let ipv6: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ip WHERE type = 'ipv6'")
        .fetch_one(pool)
        .await?;
    println!("total:            {}", total_ips);
    println!("ipv4:             {}", ipv4);
    println!("ipv6:             {}", ipv6);

    println!();
    println!("=== Query events ===");
    let total_stats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM domain_stat")
        .fetch_one(pool)
        .await?;
    println!("total:            {}", total_stats);

    let top: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT domain, COUNT(*) AS queries
        FROM domain_stat
        GROUP BY domain
        ORDER BY queries DESC
        LIMIT $1
        "#,
    )
    .bind(args.top)
    .fetch_all(pool)
    .await?;

    if !top.is_empty() {
        println!();
        println!("=== Top queried domains ===");
        for (domain, queries) in top {
            println!("{:>8}  {}", queries, domain);
        }
    }

    let unresolved: Vec<(String, i32, i32)> = sqlx::query_as(
        r#"
        SELECT d.domain, d.resolv_count, d.max_resolv
        FROM domain d
        LEFT JOIN ip i ON i.domain_id = d.id
        WHERE i.id IS NULL AND d.resolv_count >= d.max_resolv
        ORDER BY d.domain
        LIMIT 20
        "#,
    )
    .fetch_all(pool)
    .await?;

    if !unresolved.is_empty() {
        println!();
        println!("=== Exhausted without any address ===");
        for (domain, count, max) in unresolved {
            println!("{} ({}/{})", domain, count, max);
        }
    }

    store.close().await;
    Ok(())
}
