//! Captured-exchange model.
//!
//! A [`LogRecord`] is the canonical value describing one observed HTTP
//! exchange at the proxy boundary. Records are JSON-encodable (camelCase)
//! and are exactly what the session store persists as NDJSON lines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default cap on captured body text, in bytes.
pub const DEFAULT_BODY_LIMIT: usize = 64 * 1024;

/// One captured request/response exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
  /// Opaque collision-resistant id.
  pub id: String,
  /// Creation wall time, milliseconds since epoch.
  pub ts: i64,
  /// Upper-case HTTP method as observed.
  pub method: String,
  /// Fully-qualified absolute URL as observed at the proxy boundary.
  pub url: String,
  /// Authority component of `url` (`host[:port]`).
  pub host: String,
  /// Raw path component; never normalized here.
  pub path: String,
  /// Response status once the exchange terminates.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<u16>,
  /// Wall-clock duration of the exchange measured at the proxy.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub duration_ms: Option<u64>,
  pub request: CapturedRequest,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub response: Option<CapturedResponse>,
}

/// Request half of a captured exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
  /// Header name → joined value. Names keep their observed spelling;
  /// multi-valued headers are comma-joined.
  pub headers: BTreeMap<String, String>,
  /// Query key → last-wins value.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub query: Option<BTreeMap<String, String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body: Option<BodyCapture>,
}

/// Response half of a captured exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub headers: Option<BTreeMap<String, String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body: Option<BodyCapture>,
}

/// Bounded body capture: declared MIME plus the first slice of the body
/// decoded as UTF-8 (lossy).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyCapture {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mime: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
}

impl BodyCapture {
  /// Build a capture from raw body bytes already bounded by the tee.
  ///
  /// The text is re-clipped to `limit` bytes after lossy decoding so the
  /// bound holds even when replacement characters expand the data.
  pub fn from_bytes(mime: Option<String>, bytes: &[u8], limit: usize) -> Option<Self> {
    if bytes.is_empty() && mime.is_none() {
      return None;
    }
    let slice = &bytes[..bytes.len().min(limit)];
    let mut text = String::from_utf8_lossy(slice).into_owned();
    truncate_on_boundary(&mut text, limit);
    Some(BodyCapture {
      mime,
      text: if text.is_empty() { None } else { Some(text) },
    })
  }
}

impl LogRecord {
  /// Start a record for an exchange against `uri`. Status, duration, bodies
  /// and the response half are filled in when the exchange terminates.
  pub fn begin(method: &http::Method, uri: &http::Uri) -> LogRecord {
    let host = authority_host(uri);
    let path = uri.path().to_string();
    LogRecord {
      id: new_id(),
      ts: now_ms(),
      method: method.as_str().to_uppercase(),
      url: uri.to_string(),
      host,
      path,
      status: None,
      duration_ms: None,
      request: CapturedRequest::default(),
      response: None,
    }
  }
}

/// `host[:port]` of a URI, without any userinfo.
pub fn authority_host(uri: &http::Uri) -> String {
  match (uri.host(), uri.port_u16()) {
    (Some(h), Some(p)) => format!("{}:{}", h, p),
    (Some(h), None) => h.to_string(),
    _ => String::new(),
  }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

/// Allocate a fresh record id (UUID v4, 122 bits of entropy).
pub fn new_id() -> String {
  uuid::Uuid::new_v4().simple().to_string()
}

/// Case-insensitive lookup into an observed-spelling header map.
pub fn header_get<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Truncate a string to at most `limit` bytes without splitting a char.
pub fn truncate_on_boundary(text: &mut String, limit: usize) {
  if text.len() <= limit {
    return;
  }
  let mut cut = limit;
  while cut > 0 && !text.is_char_boundary(cut) {
    cut -= 1;
  }
  text.truncate(cut);
}
