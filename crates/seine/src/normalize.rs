//! Path normalization for route grouping.
//!
//! Collapses identifier-looking path segments to placeholders so that
//! `/users/42` and `/users/7` aggregate under one endpoint key.

/// Replace identifier segments with placeholders and strip a single
/// trailing slash (except for the root path).
///
/// Check order per segment: UUID, then long hex, then decimal.
pub fn normalize(path: &str) -> String {
  let trimmed = if path.len() > 1 && path.ends_with('/') {
    &path[..path.len() - 1]
  } else {
    path
  };
  let segments: Vec<&str> = trimmed
    .split('/')
    .map(|segment| {
      if segment.is_empty() {
        segment
      } else if is_uuid(segment) {
        ":uuid"
      } else if is_long_hex(segment) {
        ":hash"
      } else if segment.bytes().all(|b| b.is_ascii_digit()) {
        ":id"
      } else {
        segment
      }
    })
    .collect();
  segments.join("/")
}

/// Sorted unique query keys of an absolute URL. Unparseable URLs yield
/// an empty list.
pub fn query_keys(url: &str) -> Vec<String> {
  let uri: http::Uri = match url.parse() {
    Ok(uri) => uri,
    Err(_) => return Vec::new(),
  };
  let mut keys: Vec<String> = uri
    .query()
    .unwrap_or_default()
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(|pair| pair.split('=').next().unwrap_or(pair).to_string())
    .collect();
  keys.sort();
  keys.dedup();
  keys
}

/// UUID v1–v5: 8-4-4-4-12 hex with version nibble 1..=5 and variant
/// nibble in {8, 9, a, b}.
fn is_uuid(segment: &str) -> bool {
  let bytes = segment.as_bytes();
  if bytes.len() != 36 {
    return false;
  }
  for (i, b) in bytes.iter().enumerate() {
    match i {
      8 | 13 | 18 | 23 => {
        if *b != b'-' {
          return false;
        }
      }
      14 => {
        if !(b'1'..=b'5').contains(b) {
          return false;
        }
      }
      19 => {
        if !matches!(b.to_ascii_lowercase(), b'8' | b'9' | b'a' | b'b') {
          return false;
        }
      }
      _ => {
        if !b.is_ascii_hexdigit() {
          return false;
        }
      }
    }
  }
  true
}

fn is_long_hex(segment: &str) -> bool {
  segment.len() >= 16 && segment.bytes().all(|b| b.is_ascii_hexdigit())
}
