//! Redaction of credentials and other secret material from captured
//! exchanges.
//!
//! Sanitization never fails: any field whose parse step errors is passed
//! through unchanged rather than dropping the record.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::record::{BodyCapture, LogRecord};

/// Replacement for every redacted value.
pub const MASK: &str = "***redacted***";

/// Headers redacted by exact (lowercased) name.
const SENSITIVE_HEADERS: &[&str] = &[
  "authorization",
  "proxy-authorization",
  "cookie",
  "set-cookie",
  "x-api-key",
  "x-auth-token",
  "x-csrf-token",
  "x-xsrf-token",
  "x-amz-security-token",
];

/// Query/form keys are sensitive when the lowercased key contains one of
/// these terms (the catch-all rule; an `_term` suffix is a special case of
/// containment).
const SENSITIVE_QUERY_TERMS: &[&str] = &[
  "token",
  "access_token",
  "refresh_token",
  "id_token",
  "api_key",
  "apikey",
  "key",
  "code",
  "password",
  "passwd",
  "secret",
  "signature",
  "sig",
];

/// JSON body keys are sensitive when the lowercased key equals or contains
/// one of these terms. The whole sub-value is masked.
const SENSITIVE_JSON_TERMS: &[&str] = &[
  "password",
  "passwd",
  "secret",
  "token",
  "refresh",
  "access",
  "authorization",
  "cookie",
  "apikey",
  "api_key",
  "session",
  "csrf",
  "xsrf",
];

/// Produce a redacted copy of `record`; the input is not mutated.
pub fn sanitize(record: &LogRecord) -> LogRecord {
  let mut out = record.clone();
  redact_headers(&mut out.request.headers);
  if let Some(query) = out.request.query.as_mut() {
    redact_query(query);
  }
  if let Some(body) = out.request.body.as_mut() {
    redact_body(body);
  }
  if let Some(response) = out.response.as_mut() {
    if let Some(headers) = response.headers.as_mut() {
      redact_headers(headers);
    }
    if let Some(body) = response.body.as_mut() {
      redact_body(body);
    }
  }
  out
}

fn redact_headers(headers: &mut BTreeMap<String, String>) {
  for (name, value) in headers.iter_mut() {
    if SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
      *value = MASK.to_string();
    }
  }
}

fn is_sensitive_query_key(key: &str) -> bool {
  let key = key.to_ascii_lowercase();
  SENSITIVE_QUERY_TERMS.iter().any(|term| key.contains(term))
}

fn is_sensitive_json_key(key: &str) -> bool {
  let key = key.to_ascii_lowercase();
  SENSITIVE_JSON_TERMS.iter().any(|term| key.contains(term))
}

fn redact_query(query: &mut BTreeMap<String, String>) {
  for (key, value) in query.iter_mut() {
    if is_sensitive_query_key(key) {
      *value = MASK.to_string();
    }
  }
}

fn redact_body(body: &mut BodyCapture) {
  let Some(text) = body.text.as_ref() else {
    return;
  };
  let mime = body.mime.as_deref().unwrap_or("").to_ascii_lowercase();
  if mime.starts_with("application/x-www-form-urlencoded") {
    body.text = Some(redact_form(text));
  } else if mime.contains("application/json") || looks_like_json(text) {
    if let Some(redacted) = redact_json(text) {
      body.text = Some(redacted);
    }
  }
}

fn looks_like_json(text: &str) -> bool {
  matches!(text.trim_start().as_bytes().first(), Some(b'{') | Some(b'['))
}

fn redact_form(text: &str) -> String {
  text
    .split('&')
    .map(|pair| match pair.split_once('=') {
      Some((key, _)) if is_sensitive_query_key(key) => format!("{}={}", key, MASK),
      _ => pair.to_string(),
    })
    .collect::<Vec<_>>()
    .join("&")
}

/// `None` when the text does not parse as JSON (left untouched).
fn redact_json(text: &str) -> Option<String> {
  let mut value: Value = serde_json::from_str(text).ok()?;
  redact_value(&mut value);
  serde_json::to_string_pretty(&value).ok()
}

fn redact_value(value: &mut Value) {
  match value {
    Value::Object(map) => {
      for (key, entry) in map.iter_mut() {
        if is_sensitive_json_key(key) {
          *entry = Value::String(MASK.to_string());
        } else {
          redact_value(entry);
        }
      }
    }
    Value::Array(items) => {
      for item in items.iter_mut() {
        redact_value(item);
      }
    }
    _ => {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{CapturedResponse, LogRecord};

  fn record_with(headers: &[(&str, &str)]) -> LogRecord {
    let uri: http::Uri = "http://example.com/login?next=1".parse().unwrap();
    let mut record = LogRecord::begin(&http::Method::POST, &uri);
    for (k, v) in headers {
      record
        .request
        .headers
        .insert(k.to_string(), v.to_string());
    }
    record
  }

  #[test]
  fn masks_authorization_keeps_others() {
    let record = record_with(&[("Authorization", "Bearer abc"), ("X-Trace", "t1")]);
    let clean = sanitize(&record);
    assert_eq!(clean.request.headers["Authorization"], MASK);
    assert_eq!(clean.request.headers["X-Trace"], "t1");
    // input untouched
    assert_eq!(record.request.headers["Authorization"], "Bearer abc");
  }

  #[test]
  fn masks_set_cookie_in_response() {
    let mut record = record_with(&[]);
    let mut headers = std::collections::BTreeMap::new();
    headers.insert("Set-Cookie".to_string(), "sid=1".to_string());
    record.response = Some(CapturedResponse {
      headers: Some(headers),
      body: None,
    });
    let clean = sanitize(&record);
    assert_eq!(clean.response.unwrap().headers.unwrap()["Set-Cookie"], MASK);
  }

  #[test]
  fn masks_query_keys_by_containment() {
    let mut record = record_with(&[]);
    let mut query = std::collections::BTreeMap::new();
    query.insert("access_token".to_string(), "abc".to_string());
    query.insert("my_sig".to_string(), "s".to_string());
    query.insert("page".to_string(), "2".to_string());
    record.request.query = Some(query);
    let clean = sanitize(&record);
    let query = clean.request.query.unwrap();
    assert_eq!(query["access_token"], MASK);
    assert_eq!(query["my_sig"], MASK);
    assert_eq!(query["page"], "2");
  }

  #[test]
  fn redacts_json_body_recursively() {
    let mut record = record_with(&[]);
    record.request.body = Some(BodyCapture {
      mime: Some("application/json".to_string()),
      text: Some(r#"{"password":"p","user":{"token":"x","name":"y"}}"#.to_string()),
    });
    let clean = sanitize(&record);
    let text = clean.request.body.unwrap().text.unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["password"], MASK);
    assert_eq!(value["user"]["token"], MASK);
    assert_eq!(value["user"]["name"], "y");
  }

  #[test]
  fn masks_whole_sub_value_under_sensitive_key() {
    let mut record = record_with(&[]);
    record.request.body = Some(BodyCapture {
      mime: Some("application/json".to_string()),
      text: Some(r#"{"session":{"id":1,"nested":[1,2]},"ok":true}"#.to_string()),
    });
    let clean = sanitize(&record);
    let text = clean.request.body.unwrap().text.unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["session"], MASK);
    assert_eq!(value["ok"], true);
  }

  #[test]
  fn bare_json_detected_without_mime() {
    let mut record = record_with(&[]);
    record.request.body = Some(BodyCapture {
      mime: None,
      text: Some(r#"  {"secret":"s"}"#.to_string()),
    });
    let text = sanitize(&record).request.body.unwrap().text.unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["secret"], MASK);
  }

  #[test]
  fn unparseable_json_passes_through() {
    let mut record = record_with(&[]);
    record.request.body = Some(BodyCapture {
      mime: Some("application/json".to_string()),
      text: Some("{not json".to_string()),
    });
    let clean = sanitize(&record);
    assert_eq!(clean.request.body.unwrap().text.unwrap(), "{not json");
  }

  #[test]
  fn redacts_form_bodies() {
    let mut record = record_with(&[]);
    record.request.body = Some(BodyCapture {
      mime: Some("application/x-www-form-urlencoded".to_string()),
      text: Some("user=bob&password=hunter2&keep=1".to_string()),
    });
    let clean = sanitize(&record);
    assert_eq!(
      clean.request.body.unwrap().text.unwrap(),
      format!("user=bob&password={}&keep=1", MASK)
    );
  }
}
