//! Postgres store adapter.
//!
//! Owns the connection pool and exposes the typed operations the pipeline
//! components run against the three tables (`domain`, `ip`, `domain_stat`).
//! Concurrency correctness comes from the store's own conflict resolution
//! (`ON CONFLICT` upserts, transactional cascade deletes); callers never
//! hold application-level locks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{FromRow, PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::CollectorError;

/// Cap on open pool connections.
const POOL_MAX_CONNECTIONS: u32 = 25;
/// Idle connections kept warm.
const POOL_MIN_CONNECTIONS: u32 = 5;
/// Recycle connections after this lifetime.
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(5 * 60);
/// Give up acquiring a connection after this long.
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// A tracked domain row.
#[derive(Debug, Clone, FromRow)]
pub struct Domain {
    /// Surrogate row ID.
    pub id: i64,
    /// Domain name, unique.
    pub domain: String,
    /// Insertion time.
    pub first_seen: DateTime<Utc>,
    /// Most recent ingest observation.
    pub last_seen: DateTime<Utc>,
    /// Resolution attempts in the current cycle.
    pub resolv_count: i32,
    /// Per-cycle resolution budget.
    pub max_resolv: i32,
    /// Time of the most recent resolution attempt.
    pub last_resolv_time: DateTime<Utc>,
}

/// Address family of a stored IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpKind {
    /// An A record address.
    V4,
    /// An AAAA record address.
    V6,
}

impl IpKind {
    /// Stored textual form.
    pub fn as_str(self) -> &'static str {
        match self {
            IpKind::V4 => "ipv4",
            IpKind::V6 => "ipv6",
        }
    }
}

/// Result of materializing an export list.
#[derive(Debug, Clone, Default)]
pub struct ExportProjection {
    /// Distinct matching domain names.
    pub domains: Vec<String>,
    /// Distinct IPv4 addresses reachable from the matched domains.
    pub ipv4: Vec<String>,
    /// Distinct IPv6 addresses reachable from the matched domains.
    pub ipv6: Vec<String>,
}

impl ExportProjection {
    /// Total number of tokens the projection would emit.
    pub fn len(&self) -> usize {
        self.domains.len() + self.ipv4.len() + self.ipv6.len()
    }

    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One shared IP withheld from an export, with the domains on both sides
/// of the regex that caused the exclusion.
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedIp {
    /// The withheld address.
    pub ip: String,
    /// Matching domains that own the address.
    pub matched: Vec<String>,
    /// Non-matching domains that own the address.
    pub non_matched: Vec<String>,
}

/// Typed operations over the relational store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Open the connection pool and verify connectivity.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, CollectorError> {
        let ssl_mode = PgSslMode::from_str(&cfg.ssl_mode)
            .map_err(|e| CollectorError::Config(format!("invalid ssl_mode: {}", e)))?;

        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.database)
            .ssl_mode(ssl_mode);

        let pool = PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .min_connections(POOL_MIN_CONNECTIONS)
            .max_lifetime(POOL_MAX_LIFETIME)
            .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        info!(host = %cfg.host, database = %cfg.database, "store connected");

        Ok(Self { pool })
    }

    /// Wrap an existing pool (integration tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations in lexical order. A dirty migration state
    /// surfaces as an error and must abort boot.
    pub async fn migrate(&self) -> Result<(), CollectorError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("store migrations up to date");
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert the domain if absent, else fetch the existing row. The
    /// returned flag is true only on the path that created the row, even
    /// under concurrent callers upserting the same name.
    pub async fn upsert_domain(
        &self,
        name: &str,
        max_resolv: i32,
    ) -> Result<(Domain, bool), CollectorError> {
        let inserted = sqlx::query_as::<_, Domain>(
            r#"
            INSERT INTO domain (domain, first_seen, last_seen, resolv_count, max_resolv, last_resolv_time)
            VALUES ($1, now(), now(), 0, $2, now())
            ON CONFLICT (domain) DO NOTHING
            RETURNING id, domain, first_seen, last_seen, resolv_count, max_resolv, last_resolv_time
            "#,
        )
        .bind(name)
        .bind(max_resolv)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(domain) = inserted {
            debug!(domain = %domain.domain, id = domain.id, "registered new domain");
            return Ok((domain, true));
        }

        let existing = sqlx::query_as::<_, Domain>(
            r#"
            SELECT id, domain, first_seen, last_seen, resolv_count, max_resolv, last_resolv_time
            FROM domain WHERE domain = $1
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok((existing, false))
    }

    /// Refresh a domain's `last_seen` to the current time.
    pub async fn touch_last_seen(&self, id: i64) -> Result<(), CollectorError> {
        sqlx::query("UPDATE domain SET last_seen = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append one query-event row.
    pub async fn insert_stat(
        &self,
        domain: &str,
        client_ip: &str,
        rtype: &str,
    ) -> Result<(), CollectorError> {
        sqlx::query(
            "INSERT INTO domain_stat (domain, client_ip, rtype, timestamp) VALUES ($1, $2, $3, now())",
        )
        .bind(domain)
        .bind(client_ip)
        .bind(rtype)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Select up to `batch` domains due for resolution, oldest resolution
    /// first.
    ///
    /// One-shot mode schedules while `resolv_count < max_resolv`. Cyclic
    /// mode treats a count in the post-reset band (at or above
    /// `max_resolv * 2 / 3`) as a completed cycle and additionally requires
    /// the cooldown to have elapsed.
    pub async fn select_due(
        &self,
        batch: i64,
        cyclic: bool,
        cooldown_mins: i64,
    ) -> Result<Vec<Domain>, CollectorError> {
        let domains = if cyclic {
            sqlx::query_as::<_, Domain>(
                r#"
                SELECT id, domain, first_seen, last_seen, resolv_count, max_resolv, last_resolv_time
                FROM domain
                WHERE resolv_count < max_resolv
                  AND (resolv_count < (max_resolv * 2) / 3
                       OR last_resolv_time <= now() - make_interval(mins => $2::int))
                ORDER BY last_resolv_time ASC
                LIMIT $1
                "#,
            )
            .bind(batch)
            .bind(cooldown_mins)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, Domain>(
                r#"
                SELECT id, domain, first_seen, last_seen, resolv_count, max_resolv, last_resolv_time
                FROM domain
                WHERE resolv_count < max_resolv
                ORDER BY last_resolv_time ASC
                LIMIT $1
                "#,
            )
            .bind(batch)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(domains)
    }

    /// Insert a resolved address or refresh its `observed_time` and family
    /// on conflict of `(domain_id, ip)`.
    pub async fn upsert_ip(
        &self,
        domain_id: i64,
        ip: &str,
        kind: IpKind,
    ) -> Result<(), CollectorError> {
        sqlx::query(
            r#"
            INSERT INTO ip (domain_id, ip, type, observed_time)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (domain_id, ip) DO UPDATE SET
                observed_time = now(),
                type = EXCLUDED.type
            "#,
        )
        .bind(domain_id)
        .bind(ip)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance a domain's resolution bookkeeping in one statement: stamp
    /// `last_resolv_time` and step `resolv_count`. In cyclic mode a count
    /// about to cross the budget resets to `max_resolv * 2 / 3` instead.
    pub async fn bump_resolv(&self, id: i64, cyclic: bool) -> Result<(), CollectorError> {
        sqlx::query(
            r#"
            UPDATE domain SET
                last_resolv_time = now(),
                resolv_count = CASE
                    WHEN $2 AND resolv_count >= max_resolv - 1 THEN (max_resolv * 2) / 3
                    ELSE resolv_count + 1
                END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(cyclic)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete stat rows older than the cutoff; returns the count removed.
    pub async fn delete_stats_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CollectorError> {
        let result = sqlx::query("DELETE FROM domain_stat WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete IP rows not refreshed since the cutoff, but only under
    /// domains the domain-TTL pass will keep. `active_floor` is that pass's
    /// own cutoff; `None` when the domain TTL is disabled, in which case
    /// every parent counts as active.
    pub async fn delete_expired_ips(
        &self,
        cutoff: DateTime<Utc>,
        active_floor: Option<DateTime<Utc>>,
    ) -> Result<u64, CollectorError> {
        let result = match active_floor {
            Some(floor) => {
                sqlx::query(
                    r#"
                    DELETE FROM ip
                    WHERE observed_time < $1
                      AND domain_id IN (SELECT id FROM domain WHERE last_seen >= $2)
                    "#,
                )
                .bind(cutoff)
                .bind(floor)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("DELETE FROM ip WHERE observed_time < $1")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Delete domains unseen since the cutoff together with their IP rows,
    /// in a single transaction. Returns `(domains_deleted, ips_deleted)`.
    pub async fn delete_expired_domains(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<(u64, u64), CollectorError> {
        let mut tx = self.pool.begin().await?;

        let ips = sqlx::query(
            "DELETE FROM ip WHERE domain_id IN (SELECT id FROM domain WHERE last_seen < $1)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let domains = sqlx::query("DELETE FROM domain WHERE last_seen < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok((domains, ips))
    }

    /// Materialize an export list: distinct domains matching the regex and,
    /// per enabled family, the distinct addresses reachable from them. With
    /// `exclude_shared`, an address also owned by any non-matching domain
    /// is withheld.
    pub async fn export_projection(
        &self,
        pattern: &str,
        include_ipv4: bool,
        include_ipv6: bool,
        exclude_shared: bool,
    ) -> Result<ExportProjection, CollectorError> {
        let domains: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT domain FROM domain WHERE domain ~ $1 ORDER BY domain")
                .bind(pattern)
                .fetch_all(&self.pool)
                .await?;

        let mut projection = ExportProjection {
            domains,
            ..Default::default()
        };

        if include_ipv4 {
            projection.ipv4 = self
                .projection_ips(pattern, IpKind::V4, exclude_shared)
                .await?;
        }
        if include_ipv6 {
            projection.ipv6 = self
                .projection_ips(pattern, IpKind::V6, exclude_shared)
                .await?;
        }

        Ok(projection)
    }

    async fn projection_ips(
        &self,
        pattern: &str,
        kind: IpKind,
        exclude_shared: bool,
    ) -> Result<Vec<String>, CollectorError> {
        let ips = if exclude_shared {
            sqlx::query_scalar(
                r#"
                SELECT DISTINCT ip.ip
                FROM ip
                JOIN domain d ON d.id = ip.domain_id
                WHERE d.domain ~ $1 AND ip.type = $2
                  AND NOT EXISTS (
                      SELECT 1
                      FROM ip other
                      JOIN domain od ON od.id = other.domain_id
                      WHERE other.ip = ip.ip AND od.domain !~ $1
                  )
                ORDER BY ip.ip
                "#,
            )
            .bind(pattern)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_scalar(
                r#"
                SELECT DISTINCT ip.ip
                FROM ip
                JOIN domain d ON d.id = ip.domain_id
                WHERE d.domain ~ $1 AND ip.type = $2
                ORDER BY ip.ip
                "#,
            )
            .bind(pattern)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?
        };

        Ok(ips)
    }

    /// The exact address set the shared-IP exclusion withholds, with the
    /// matching and non-matching owners of each address.
    pub async fn excluded_ips(
        &self,
        pattern: &str,
        include_ipv4: bool,
        include_ipv6: bool,
    ) -> Result<Vec<ExcludedIp>, CollectorError> {
        let mut kinds: Vec<&str> = Vec::new();
        if include_ipv4 {
            kinds.push(IpKind::V4.as_str());
        }
        if include_ipv6 {
            kinds.push(IpKind::V6.as_str());
        }
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let kinds: Vec<String> = kinds.into_iter().map(String::from).collect();

        let rows = sqlx::query(
            r#"
            SELECT ip.ip,
                   array_agg(DISTINCT d.domain) FILTER (WHERE d.domain ~ $1) AS matched,
                   array_agg(DISTINCT d.domain) FILTER (WHERE d.domain !~ $1) AS non_matched
            FROM ip
            JOIN domain d ON d.id = ip.domain_id
            WHERE ip.type = ANY($2)
            GROUP BY ip.ip
            HAVING bool_or(d.domain ~ $1) AND bool_or(d.domain !~ $1)
            ORDER BY ip.ip
            "#,
        )
        .bind(pattern)
        .bind(&kinds)
        .fetch_all(&self.pool)
        .await?;

        let mut excluded = Vec::with_capacity(rows.len());
        for row in rows {
            let matched: Option<Vec<String>> = row.try_get("matched")?;
            let non_matched: Option<Vec<String>> = row.try_get("non_matched")?;
            excluded.push(ExcludedIp {
                ip: row.try_get("ip")?,
                matched: matched.unwrap_or_default(),
                non_matched: non_matched.unwrap_or_default(),
            });
        }

        Ok(excluded)
    }

    /// Count tracked domains.
    pub async fn count_domains(&self) -> Result<i64, CollectorError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM domain")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Count stored IP rows.
    pub async fn count_ips(&self) -> Result<i64, CollectorError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM ip")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
