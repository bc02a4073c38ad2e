//! Route report aggregation.
//!
//! Folds a session's log sequence into per-endpoint summaries keyed by
//! `"METHOD host normalizedPath"`. Reports are pure functions of the log
//! list and are cached by the session store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::normalize::{normalize, query_keys};
use crate::record::{now_ms, truncate_on_boundary, LogRecord};

/// Sample bodies inside a report are clipped to this many bytes.
pub const SAMPLE_BODY_LIMIT: usize = 2048;
/// A sample keeps at most this many headers per side.
pub const SAMPLE_HEADER_LIMIT: usize = 30;

const TRUNCATION_SUFFIX: &str = "\n…(truncated)";

/// Request/response MIME distributions of one endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MimeCounts {
  pub req: BTreeMap<String, u64>,
  pub res: BTreeMap<String, u64>,
}

/// Aggregate view of one endpoint (normalized path × method × host).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSummary {
  /// `"METHOD host normalizedPath"`.
  pub key: String,
  pub method: String,
  pub host: String,
  /// Normalized path.
  pub path: String,
  pub count: u64,
  /// Status code (stringified, `"0"` for unfinished exchanges) → count.
  pub statuses: BTreeMap<String, u64>,
  pub mime: MimeCounts,
  /// Sorted unique query keys seen across all hits.
  pub query_keys: Vec<String>,
  /// One representative record, headers capped and bodies clipped.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sample: Option<LogRecord>,
}

/// Aggregation of one session's logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteReport {
  pub route_key: String,
  pub session_id: String,
  pub created_at: i64,
  /// Count of input logs, including those whose URL failed to parse.
  pub total_logs: u64,
  pub endpoints: Vec<EndpointSummary>,
}

/// Build a report from a log list. Logs whose `url` does not parse are
/// counted in `totalLogs` but contribute no endpoint.
pub fn build_report(route_key: &str, session_id: &str, logs: &[LogRecord]) -> RouteReport {
  let mut endpoints: BTreeMap<String, EndpointSummary> = BTreeMap::new();
  for log in logs {
    let Ok(uri) = log.url.parse::<http::Uri>() else {
      continue;
    };
    if uri.host().is_none() {
      continue;
    }
    let host = crate::record::authority_host(&uri);
    let path = normalize(uri.path());
    let method = if log.method.is_empty() {
      "GET".to_string()
    } else {
      log.method.to_uppercase()
    };
    let key = format!("{} {} {}", method, host, path);

    let summary = endpoints.entry(key.clone()).or_insert_with(|| EndpointSummary {
      key,
      method,
      host,
      path,
      count: 0,
      statuses: BTreeMap::new(),
      mime: MimeCounts::default(),
      query_keys: Vec::new(),
      sample: Some(make_sample(log)),
    });

    summary.count += 1;
    let status = log.status.unwrap_or(0).to_string();
    *summary.statuses.entry(status).or_default() += 1;
    if let Some(mime) = log.request.body.as_ref().and_then(|b| b.mime.as_deref()) {
      *summary.mime.req.entry(mime_segment(mime)).or_default() += 1;
    }
    if let Some(mime) = log
      .response
      .as_ref()
      .and_then(|r| r.body.as_ref())
      .and_then(|b| b.mime.as_deref())
    {
      *summary.mime.res.entry(mime_segment(mime)).or_default() += 1;
    }
    let mut keys = std::mem::take(&mut summary.query_keys);
    keys.extend(query_keys(&log.url));
    keys.sort();
    keys.dedup();
    summary.query_keys = keys;
  }

  let mut endpoints: Vec<EndpointSummary> = endpoints.into_values().collect();
  // stable sort: count descending, key order as the secondary
  endpoints.sort_by(|a, b| b.count.cmp(&a.count));

  RouteReport {
    route_key: route_key.to_string(),
    session_id: session_id.to_string(),
    created_at: now_ms(),
    total_logs: logs.len() as u64,
    endpoints,
  }
}

/// Lowercased media type without parameters (`text/html; charset=x` → `text/html`).
fn mime_segment(mime: &str) -> String {
  mime
    .to_ascii_lowercase()
    .split(';')
    .next()
    .unwrap_or_default()
    .trim()
    .to_string()
}

/// A representative record for an endpoint: the first 30 headers in
/// lexicographic order per side, bodies clipped to 2 KiB.
fn make_sample(log: &LogRecord) -> LogRecord {
  let mut sample = log.clone();
  cap_headers(&mut sample.request.headers);
  if let Some(body) = sample.request.body.as_mut() {
    clip_body_text(body);
  }
  if let Some(response) = sample.response.as_mut() {
    if let Some(headers) = response.headers.as_mut() {
      cap_headers(headers);
    }
    if let Some(body) = response.body.as_mut() {
      clip_body_text(body);
    }
  }
  sample
}

fn cap_headers(headers: &mut BTreeMap<String, String>) {
  // BTreeMap iteration is already lexicographic
  if headers.len() > SAMPLE_HEADER_LIMIT {
    let keep: Vec<String> = headers.keys().take(SAMPLE_HEADER_LIMIT).cloned().collect();
    headers.retain(|k, _| keep.binary_search(k).is_ok());
  }
}

fn clip_body_text(body: &mut crate::record::BodyCapture) {
  if let Some(text) = body.text.as_mut() {
    if text.len() > SAMPLE_BODY_LIMIT {
      truncate_on_boundary(text, SAMPLE_BODY_LIMIT);
      text.push_str(TRUNCATION_SUFFIX);
    }
  }
}
