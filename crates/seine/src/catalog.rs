//! Cross-session catalog assembly.
//!
//! Loads (or lazily builds) each stored session's route report and merges
//! the reports of sessions sharing a route key into one aggregate report
//! per route.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::now_ms;
use crate::report::{build_report, EndpointSummary, RouteReport};
use crate::session::{SessionMeta, SessionStore};

/// Per-session logs read for an on-demand report build.
const REPORT_LOG_LIMIT: usize = 50_000;

/// Union of route reports across all stored sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteCatalog {
  pub created_at: i64,
  pub route_reports: Vec<RouteReport>,
}

/// Grouping label for a session: nominated route key, else the session
/// name, else `/`.
pub fn route_key_of(meta: &SessionMeta) -> String {
  meta
    .route_key
    .clone()
    .filter(|k| !k.is_empty())
    .or_else(|| Some(meta.name.clone()).filter(|n| !n.is_empty()))
    .unwrap_or_else(|| "/".to_string())
}

/// Load a session's cached report, building and caching one when missing.
pub async fn report_for_session(store: &SessionStore, meta: &SessionMeta) -> RouteReport {
  if let Some(cached) = store.read_report(&meta.id).await {
    return cached;
  }
  let logs = store
    .read_logs(&meta.id, REPORT_LOG_LIMIT)
    .await
    .unwrap_or_default();
  let report = build_report(&route_key_of(meta), &meta.id, &logs);
  if let Err(err) = store.write_report(&meta.id, &report).await {
    tracing::warn!("failed to cache report for session {}: {}", meta.id, err);
  }
  report
}

/// Build the catalog over every stored session, grouped by route key and
/// sorted by route key ascending.
pub async fn build_catalog(store: &SessionStore) -> RouteCatalog {
  let sessions = store.list().await.unwrap_or_default();
  let mut groups: BTreeMap<String, Vec<RouteReport>> = BTreeMap::new();
  for meta in &sessions {
    let report = report_for_session(store, meta).await;
    groups.entry(route_key_of(meta)).or_default().push(report);
  }

  let route_reports = groups
    .into_iter()
    .map(|(route_key, reports)| merge_reports(&route_key, reports))
    .collect();

  RouteCatalog {
    created_at: now_ms(),
    route_reports,
  }
}

/// Merge several session reports for one route into a single report whose
/// session id is the synthetic `"<routeKey> (<n> sessions)"` label.
pub fn merge_reports(route_key: &str, reports: Vec<RouteReport>) -> RouteReport {
  let session_count = reports.len();
  let mut endpoints: BTreeMap<String, EndpointSummary> = BTreeMap::new();
  let mut total_logs = 0;

  for report in reports {
    total_logs += report.total_logs;
    for endpoint in report.endpoints {
      match endpoints.get_mut(&endpoint.key) {
        None => {
          endpoints.insert(endpoint.key.clone(), endpoint);
        }
        Some(merged) => {
          merged.count += endpoint.count;
          for (status, count) in endpoint.statuses {
            *merged.statuses.entry(status).or_default() += count;
          }
          for (mime, count) in endpoint.mime.req {
            *merged.mime.req.entry(mime).or_default() += count;
          }
          for (mime, count) in endpoint.mime.res {
            *merged.mime.res.entry(mime).or_default() += count;
          }
          merged.query_keys.extend(endpoint.query_keys);
          merged.query_keys.sort();
          merged.query_keys.dedup();
          // sample stays the first encountered
        }
      }
    }
  }

  let mut endpoints: Vec<EndpointSummary> = endpoints.into_values().collect();
  endpoints.sort_by(|a, b| b.count.cmp(&a.count));

  RouteReport {
    route_key: route_key.to_string(),
    session_id: format!("{} ({} sessions)", route_key, session_count),
    created_at: now_ms(),
    total_logs,
    endpoints,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::LogRecord;

  fn log(url: &str, status: u16) -> LogRecord {
    let uri: http::Uri = url.parse().unwrap();
    let mut record = LogRecord::begin(&http::Method::GET, &uri);
    record.status = Some(status);
    record
  }

  #[test]
  fn merge_adds_counts_elementwise() {
    let a = build_report("/api", "s1", &[log("http://h/a?x=1", 200), log("http://h/a", 200)]);
    let b = build_report("/api", "s2", &[log("http://h/a?y=2", 500)]);
    let merged = merge_reports("/api", vec![a, b]);

    assert_eq!(merged.session_id, "/api (2 sessions)");
    assert_eq!(merged.total_logs, 3);
    assert_eq!(merged.endpoints.len(), 1);
    let endpoint = &merged.endpoints[0];
    assert_eq!(endpoint.count, 3);
    assert_eq!(endpoint.statuses["200"], 2);
    assert_eq!(endpoint.statuses["500"], 1);
    assert_eq!(endpoint.query_keys, ["x", "y"]);
  }

  #[test]
  fn merge_keeps_first_sample() {
    let a = build_report("/r", "s1", &[log("http://h/a", 200)]);
    let first_sample_id = a.endpoints[0].sample.as_ref().unwrap().id.clone();
    let b = build_report("/r", "s2", &[log("http://h/a", 200)]);
    let merged = merge_reports("/r", vec![a, b]);
    assert_eq!(
      merged.endpoints[0].sample.as_ref().unwrap().id,
      first_sample_id
    );
  }

  #[test]
  fn route_key_falls_back_to_name() {
    let meta = SessionMeta {
      id: "x".into(),
      name: "checkout".into(),
      route_key: None,
      created_at: 0,
      ended_at: None,
      log_count: 0,
      dir: String::new(),
      logs_path: String::new(),
    };
    assert_eq!(route_key_of(&meta), "checkout");
  }

  #[tokio::test]
  async fn catalog_groups_and_sorts_by_route_key() {
    let root = std::env::temp_dir().join(format!("seine-catalog-{}", crate::record::new_id()));
    let store = SessionStore::new(&root);
    store.init().await.unwrap();

    store.start(Some("b".into()), Some("/beta".into())).await.unwrap();
    store.append(&log("http://h/b", 200)).await.unwrap();
    store.stop().await.unwrap();

    store.start(Some("a".into()), Some("/alpha".into())).await.unwrap();
    store.append(&log("http://h/a", 200)).await.unwrap();
    store.stop().await.unwrap();

    let catalog = build_catalog(&store).await;
    let keys: Vec<&str> = catalog
      .route_reports
      .iter()
      .map(|r| r.route_key.as_str())
      .collect();
    assert_eq!(keys, ["/alpha", "/beta"]);

    // lazy report was cached on first build
    let sessions = store.list().await.unwrap();
    for meta in sessions {
      assert!(store.read_report(&meta.id).await.is_some());
    }
    std::fs::remove_dir_all(&root).ok();
  }
}
