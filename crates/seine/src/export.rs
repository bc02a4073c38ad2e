//! Session and catalog export renderers.
//!
//! The HAR output follows the HAR 1.2 shape: one entry per record,
//! `timings.wait` carries the measured duration, header/body sizes are
//! reported as unknown (`-1`), and `postData` appears only when a request
//! body text was captured.

use serde_json::{json, Value};

use crate::catalog::RouteCatalog;
use crate::record::LogRecord;
use crate::report::RouteReport;
use crate::session::SessionMeta;

fn header_array(headers: &std::collections::BTreeMap<String, String>) -> Vec<Value> {
  headers
    .iter()
    .map(|(name, value)| json!({ "name": name, "value": value }))
    .collect()
}

fn started_date_time(ts_ms: i64) -> String {
  chrono::DateTime::from_timestamp_millis(ts_ms)
    .unwrap_or_default()
    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Render a log list as a HAR 1.2 document.
pub fn to_har(logs: &[LogRecord]) -> Value {
  let entries: Vec<Value> = logs.iter().map(har_entry).collect();
  json!({
    "log": {
      "version": "1.2",
      "creator": { "name": "seine", "version": env!("CARGO_PKG_VERSION") },
      "entries": entries,
    }
  })
}

fn har_entry(log: &LogRecord) -> Value {
  let wait = log.duration_ms.unwrap_or(0);
  let query_string: Vec<Value> = log
    .request
    .query
    .as_ref()
    .map(|query| {
      query
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect()
    })
    .unwrap_or_default();

  let mut request = json!({
    "method": log.method,
    "url": log.url,
    "httpVersion": "HTTP/1.1",
    "headers": header_array(&log.request.headers),
    "queryString": query_string,
    "cookies": [],
    "headersSize": -1,
    "bodySize": -1,
  });
  if let Some(body) = log.request.body.as_ref() {
    if let Some(text) = body.text.as_ref().filter(|t| !t.is_empty()) {
      request["postData"] = json!({
        "mimeType": body.mime.clone().unwrap_or_default(),
        "text": text,
      });
    }
  }

  let (response_headers, content) = match log.response.as_ref() {
    Some(response) => {
      let headers = response
        .headers
        .as_ref()
        .map(header_array)
        .unwrap_or_default();
      let text = response
        .body
        .as_ref()
        .and_then(|b| b.text.clone())
        .unwrap_or_default();
      let mime = response
        .body
        .as_ref()
        .and_then(|b| b.mime.clone())
        .unwrap_or_default();
      (headers, json!({ "size": text.len(), "mimeType": mime, "text": text }))
    }
    None => (Vec::new(), json!({ "size": 0, "mimeType": "", "text": "" })),
  };

  json!({
    "startedDateTime": started_date_time(log.ts),
    "time": wait,
    "request": request,
    "response": {
      "status": log.status.unwrap_or(0),
      "statusText": "",
      "httpVersion": "HTTP/1.1",
      "headers": response_headers,
      "cookies": [],
      "content": content,
      "redirectURL": "",
      "headersSize": -1,
      "bodySize": -1,
    },
    "cache": {},
    "timings": { "send": 0, "wait": wait, "receive": 0 },
  })
}

/// Render one session report as a Markdown API catalog.
pub fn session_markdown(meta: &SessionMeta, report: &RouteReport) -> String {
  let mut out = String::new();
  out.push_str(&format!("# Session: {}\n\n", meta.name));
  out.push_str(&format!(
    "- id: `{}`\n- logs: {}\n- created: {}\n\n",
    meta.id,
    meta.log_count,
    started_date_time(meta.created_at)
  ));
  render_report(&mut out, report);
  out
}

/// Render the cross-session catalog as Markdown.
pub fn catalog_markdown(catalog: &RouteCatalog) -> String {
  let mut out = String::new();
  out.push_str("# API Catalog\n\n");
  out.push_str(&format!(
    "Built {} over {} route(s).\n\n",
    started_date_time(catalog.created_at),
    catalog.route_reports.len()
  ));
  for report in &catalog.route_reports {
    out.push_str(&format!("## Route: {}\n\n", report.route_key));
    out.push_str(&format!("_{}_, {} log(s)\n\n", report.session_id, report.total_logs));
    render_report(&mut out, report);
  }
  out
}

fn render_report(out: &mut String, report: &RouteReport) {
  if report.endpoints.is_empty() {
    out.push_str("No endpoints captured.\n\n");
    return;
  }
  out.push_str("| Method | Host | Path | Count | Statuses | Query keys |\n");
  out.push_str("|---|---|---|---|---|---|\n");
  for endpoint in &report.endpoints {
    let statuses = endpoint
      .statuses
      .iter()
      .map(|(status, count)| format!("{}×{}", status, count))
      .collect::<Vec<_>>()
      .join(", ");
    out.push_str(&format!(
      "| {} | {} | {} | {} | {} | {} |\n",
      endpoint.method,
      endpoint.host,
      endpoint.path,
      endpoint.count,
      statuses,
      endpoint.query_keys.join(", ")
    ));
  }
  out.push('\n');
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::BodyCapture;
  use crate::report::build_report;

  fn log(url: &str, status: u16) -> LogRecord {
    let uri: http::Uri = url.parse().unwrap();
    let mut record = LogRecord::begin(&http::Method::GET, &uri);
    record.status = Some(status);
    record.duration_ms = Some(42);
    record
  }

  #[test]
  fn har_has_one_entry_per_record() {
    let mut with_body = log("http://h/a", 200);
    with_body.request.body = Some(BodyCapture {
      mime: Some("application/json".into()),
      text: Some("{}".into()),
    });
    let har = to_har(&[with_body, log("http://h/b", 404)]);
    let entries = har["log"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(har["log"]["version"], "1.2");
    assert_eq!(entries[0]["timings"]["wait"], 42);
    assert_eq!(entries[0]["request"]["postData"]["mimeType"], "application/json");
    // no body captured → no postData
    assert!(entries[1]["request"].get("postData").is_none());
    assert_eq!(entries[1]["response"]["status"], 404);
    assert_eq!(entries[1]["request"]["headersSize"], -1);
  }

  #[test]
  fn markdown_lists_endpoints() {
    let report = build_report("/api", "s1", &[log("http://h/users/7?page=1", 200)]);
    let meta = SessionMeta {
      id: "s1".into(),
      name: "demo".into(),
      route_key: Some("/api".into()),
      created_at: 0,
      ended_at: None,
      log_count: 1,
      dir: String::new(),
      logs_path: String::new(),
    };
    let markdown = session_markdown(&meta, &report);
    assert!(markdown.contains("# Session: demo"));
    assert!(markdown.contains("| GET | h | /users/:id | 1 |"));
    assert!(markdown.contains("page"));
  }
}
