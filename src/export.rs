//! Export projector and HTTP surface.
//!
//! Each configured export list becomes a GET endpoint serving a plain-text
//! projection of the inventory: matching domains first (trailing dot
//! stripped), then IPv4 addresses, then IPv6 addresses, one token per
//! line. Lists with the shared-IP exclusion enabled can expose a sibling
//! JSON endpoint describing exactly which addresses were withheld and why.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use regex::Regex;
use serde_json::json;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExportListConfig;
use crate::error::CollectorError;
use crate::store::{ExportProjection, Store};

/// Maximum accepted regex pattern length.
const MAX_PATTERN_LEN: usize = 200;

/// Sub-strings rejected as catastrophic-backtracking risks.
const BLOCKED_CONSTRUCTS: [&str; 4] = ["(.*)*", "(.+)+", "(.*)+", "(.+)*"];

/// Row ceiling guarding export responses.
const MAX_EXPORT_ROWS: usize = 100_000;

/// Cache window advertised on plain-text projections.
const CACHE_CONTROL: &str = "public, max-age=300";

/// Validate an export regex: bounded length, no blocked constructs, and it
/// must compile.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(format!(
            "regex too long ({} > {} characters)",
            pattern.len(),
            MAX_PATTERN_LEN
        ));
    }
    for construct in BLOCKED_CONSTRUCTS {
        if pattern.contains(construct) {
            return Err(format!(
                "regex contains blocked construct '{}'",
                construct
            ));
        }
    }
    Regex::new(pattern).map_err(|e| format!("invalid regex: {}", e))?;
    Ok(())
}

/// Render a projection as the plain-text wire format.
pub fn render_projection(projection: &ExportProjection, include_domains: bool) -> String {
    let mut out = String::new();

    if include_domains {
        for domain in &projection.domains {
            out.push_str(domain.trim_end_matches('.'));
            out.push('\n');
        }
    }
    for ip in &projection.ipv4 {
        out.push_str(ip);
        out.push('\n');
    }
    for ip in &projection.ipv6 {
        out.push_str(ip);
        out.push('\n');
    }

    out
}

/// Parse an additional-IPs file: one address per line, blank lines and
/// `#` comments ignored, unparseable lines skipped with a warning.
pub fn parse_additional_ips(content: &str) -> (Vec<String>, Vec<String>) {
    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => ipv4.push(addr.to_string()),
            Ok(IpAddr::V6(addr)) => ipv6.push(addr.to_string()),
            Err(_) => warn!(line, "skipping unparseable additional IP"),
        }
    }

    (ipv4, ipv6)
}

/// Merge additional addresses into a projection, deduplicating against
/// what the store already produced.
pub fn merge_additional_ips(projection: &mut ExportProjection, ipv4: Vec<String>, ipv6: Vec<String>) {
    for ip in ipv4 {
        if !projection.ipv4.contains(&ip) {
            projection.ipv4.push(ip);
        }
    }
    for ip in ipv6 {
        if !projection.ipv6.contains(&ip) {
            projection.ipv6.push(ip);
        }
    }
}

/// An error returned by an export handler.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The projection exceeds the export row ceiling.
    #[error("dataset too large to export: {0} rows")]
    PayloadTooLarge(usize),

    /// The store rejected or failed the query.
    #[error("store error: {0}")]
    Store(#[from] CollectorError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::PayloadTooLarge(rows) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "dataset too large to export: {} rows exceed the {} row limit",
                    rows, MAX_EXPORT_ROWS
                ),
            ),
            ApiError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// One export list bound to the store.
struct ExportTarget {
    cfg: ExportListConfig,
    store: Store,
}

async fn export_list(target: Arc<ExportTarget>) -> Result<Response, ApiError> {
    let cfg = &target.cfg;

    let mut projection = target
        .store
        .export_projection(
            &cfg.domain_regex,
            cfg.include_ipv4,
            cfg.include_ipv6,
            cfg.exclude_shared_ips,
        )
        .await?;

    if projection.len() > MAX_EXPORT_ROWS {
        return Err(ApiError::PayloadTooLarge(projection.len()));
    }

    if projection.is_empty() {
        debug!(list = %cfg.name, regex = %cfg.domain_regex, "export list is empty");
    }

    if let Some(file) = &cfg.additional_ips_file {
        match tokio::fs::read_to_string(Path::new(file)).await {
            Ok(content) => {
                let (ipv4, ipv6) = parse_additional_ips(&content);
                merge_additional_ips(&mut projection, ipv4, ipv6);
            }
            Err(e) => warn!(list = %cfg.name, file, "failed to read additional IPs: {}", e),
        }
    }

    let body = render_projection(&projection, cfg.include_domains);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, CACHE_CONTROL),
        ],
        body,
    )
        .into_response())
}

async fn excluded_ips(target: Arc<ExportTarget>) -> Result<Response, ApiError> {
    let cfg = &target.cfg;

    let excluded = target
        .store
        .excluded_ips(&cfg.domain_regex, cfg.include_ipv4, cfg.include_ipv6)
        .await?;

    if excluded.len() > MAX_EXPORT_ROWS {
        return Err(ApiError::PayloadTooLarge(excluded.len()));
    }

    Ok(Json(excluded).into_response())
}

async fn health() -> &'static str {
    "OK"
}

/// Build the export router for the configured lists.
pub fn export_router(lists: &[ExportListConfig], store: Store) -> Router {
    let mut router = Router::new().route("/health", get(health));

    for list in lists {
        let target = Arc::new(ExportTarget {
            cfg: list.clone(),
            store: store.clone(),
        });

        let list_target = target.clone();
        router = router.route(
            &list.endpoint,
            get(move || export_list(list_target.clone())),
        );

        if let Some(endpoint) = &list.excluded_ips_endpoint {
            let diag_target = target.clone();
            router = router.route(endpoint, get(move || excluded_ips(diag_target.clone())));
        }

        debug!(list = %list.name, endpoint = %list.endpoint, "registered export list");
    }

    router
}

/// Serve the export endpoints until shutdown.
pub async fn serve(
    port: u16,
    lists: Vec<ExportListConfig>,
    store: Store,
    shutdown: CancellationToken,
) -> Result<(), CollectorError> {
    let app = export_router(&lists, store);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, lists = lists.len(), "export endpoints listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("export server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_at_length_limit_accepted() {
        let pattern = "a".repeat(MAX_PATTERN_LEN);
        assert!(validate_pattern(&pattern).is_ok());
    }

    #[test]
    fn test_pattern_over_length_limit_rejected() {
        let pattern = "a".repeat(MAX_PATTERN_LEN + 1);
        assert!(validate_pattern(&pattern).is_err());
    }

    #[test]
    fn test_blocked_constructs_rejected() {
        for construct in BLOCKED_CONSTRUCTS {
            let pattern = format!("^prefix{}$", construct);
            assert!(
                validate_pattern(&pattern).is_err(),
                "expected '{}' to be rejected",
                construct
            );
        }
    }

    #[test]
    fn test_uncompilable_pattern_rejected() {
        assert!(validate_pattern("(unclosed").is_err());
    }

    #[test]
    fn test_ordinary_pattern_accepted() {
        assert!(validate_pattern(r"^ads\..*\.example\.com$").is_ok());
    }

    #[test]
    fn test_render_orders_sections_and_strips_trailing_dot() {
        let projection = ExportProjection {
            domains: vec!["a.example.".to_string(), "b.example".to_string()],
            ipv4: vec!["1.2.3.4".to_string()],
            ipv6: vec!["2001:db8::1".to_string()],
        };

        let body = render_projection(&projection, true);
        assert_eq!(body, "a.example\nb.example\n1.2.3.4\n2001:db8::1\n");
    }

    #[test]
    fn test_render_can_omit_domains() {
        let projection = ExportProjection {
            domains: vec!["a.example".to_string()],
            ipv4: vec!["1.2.3.4".to_string()],
            ipv6: Vec::new(),
        };

        let body = render_projection(&projection, false);
        assert_eq!(body, "1.2.3.4\n");
    }

    #[test]
    fn test_parse_additional_ips_classifies_families() {
        let content = "# extras\n1.2.3.4\n\n2001:db8::5\nnot-an-ip\n 10.0.0.1 \n";
        let (ipv4, ipv6) = parse_additional_ips(content);
        assert_eq!(ipv4, vec!["1.2.3.4", "10.0.0.1"]);
        assert_eq!(ipv6, vec!["2001:db8::5"]);
    }

    #[test]
    fn test_merge_additional_ips_deduplicates() {
        let mut projection = ExportProjection {
            domains: Vec::new(),
            ipv4: vec!["1.2.3.4".to_string()],
            ipv6: Vec::new(),
        };

        merge_additional_ips(
            &mut projection,
            vec!["1.2.3.4".to_string(), "5.6.7.8".to_string()],
            vec!["2001:db8::1".to_string()],
        );

        assert_eq!(projection.ipv4, vec!["1.2.3.4", "5.6.7.8"]);
        assert_eq!(projection.ipv6, vec!["2001:db8::1"]);
    }
}
