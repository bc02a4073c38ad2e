//! On-disk session store.
//!
//! Each capture session owns a directory under the store root:
//!
//! ```text
//! <root>/<sessionId>/meta.json      session metadata
//! <root>/<sessionId>/logs.ndjson    one LogRecord JSON per line, append-only
//! <root>/<sessionId>/report.json    cached route report (lazy)
//! ```
//!
//! At most one session is "current" per store. A single async mutex makes
//! each `start`/`append`/`stop` call atomic; cross-call ordering is the
//! caller's responsibility (the proxy routes all three through one writer
//! queue so appends can never reorder around session boundaries).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::{Error, Result};
use crate::record::{new_id, now_ms, LogRecord};
use crate::report::RouteReport;

/// `meta.json` is rewritten every this many appends (and on `stop`).
pub const META_FLUSH_INTERVAL: u64 = 25;

const META_FILE: &str = "meta.json";
const LOGS_FILE: &str = "logs.ndjson";
const REPORT_FILE: &str = "report.json";

/// Metadata describing one capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
  pub id: String,
  pub name: String,
  /// Catalog grouping label nominated at session start.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub route_key: Option<String>,
  pub created_at: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ended_at: Option<i64>,
  pub log_count: u64,
  pub dir: String,
  pub logs_path: String,
}

struct CurrentSession {
  meta: SessionMeta,
  file: fs::File,
  appends_since_flush: u64,
}

/// Store of capture sessions rooted at a directory.
pub struct SessionStore {
  root: PathBuf,
  current: Mutex<Option<CurrentSession>>,
}

impl SessionStore {
  /// Create a store rooted at `root`. Call [`SessionStore::init`] before use.
  pub fn new(root: impl Into<PathBuf>) -> SessionStore {
    SessionStore {
      root: root.into(),
      current: Mutex::new(None),
    }
  }

  /// Default root: `<cwd>/data/sessions`.
  pub fn default_root() -> PathBuf {
    std::env::current_dir()
      .unwrap_or_else(|_| PathBuf::from("."))
      .join("data")
      .join("sessions")
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Ensure the root directory exists.
  pub async fn init(&self) -> Result<()> {
    fs::create_dir_all(&self.root).await?;
    Ok(())
  }

  fn dir_for(&self, id: &str) -> PathBuf {
    self.root.join(id)
  }

  /// Enumerate stored sessions, newest first. Entries whose `meta.json`
  /// is missing or malformed are skipped.
  pub async fn list(&self) -> Result<Vec<SessionMeta>> {
    let mut sessions = Vec::new();
    let mut entries = match fs::read_dir(&self.root).await {
      Ok(entries) => entries,
      Err(_) => return Ok(sessions),
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
      let is_dir = entry
        .file_type()
        .await
        .map(|t| t.is_dir())
        .unwrap_or(false);
      if !is_dir {
        continue;
      }
      let id = entry.file_name().to_string_lossy().into_owned();
      if let Some(meta) = self.read(&id).await {
        sessions.push(meta);
      }
    }
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(sessions)
  }

  /// Parse one session's metadata; `None` on any error.
  pub async fn read(&self, id: &str) -> Option<SessionMeta> {
    let raw = fs::read(self.dir_for(id).join(META_FILE)).await.ok()?;
    serde_json::from_slice(&raw).ok()
  }

  /// Metadata of the current session, if any.
  pub async fn current(&self) -> Option<SessionMeta> {
    self.current.lock().await.as_ref().map(|c| c.meta.clone())
  }

  /// Start a new session, stopping the current one first if present.
  pub async fn start(
    &self,
    name: Option<String>,
    route_key: Option<String>,
  ) -> Result<SessionMeta> {
    let mut current = self.current.lock().await;
    if let Some(previous) = current.take() {
      finish(previous).await?;
    }
    let id = new_id();
    let created_at = now_ms();
    let dir = self.dir_for(&id);
    fs::create_dir_all(&dir).await?;
    let logs_path = dir.join(LOGS_FILE);
    let name = name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| {
      format!("Session {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
    });
    let meta = SessionMeta {
      id,
      name,
      route_key: route_key.filter(|k| !k.trim().is_empty()),
      created_at,
      ended_at: None,
      log_count: 0,
      dir: dir.to_string_lossy().into_owned(),
      logs_path: logs_path.to_string_lossy().into_owned(),
    };
    write_meta(&dir, &meta).await?;
    let file = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&logs_path)
      .await?;
    *current = Some(CurrentSession {
      meta: meta.clone(),
      file,
      appends_since_flush: 0,
    });
    Ok(meta)
  }

  /// Append a record to the current session's log file. A no-op without a
  /// current session. The on-disk `meta.json` is refreshed every
  /// [`META_FLUSH_INTERVAL`] appends; `stop` writes the final value.
  pub async fn append(&self, record: &LogRecord) -> Result<()> {
    let mut guard = self.current.lock().await;
    let Some(current) = guard.as_mut() else {
      return Ok(());
    };
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    current.file.write_all(line.as_bytes()).await?;
    current.meta.log_count += 1;
    current.appends_since_flush += 1;
    if current.appends_since_flush >= META_FLUSH_INTERVAL {
      current.appends_since_flush = 0;
      let dir = PathBuf::from(&current.meta.dir);
      write_meta(&dir, &current.meta).await?;
    }
    Ok(())
  }

  /// Stop the current session: set `endedAt`, flush the final metadata
  /// and release the log-file handle. `None` when no session is active.
  pub async fn stop(&self) -> Result<Option<SessionMeta>> {
    let mut current = self.current.lock().await;
    match current.take() {
      Some(session) => Ok(Some(finish(session).await?)),
      None => Ok(None),
    }
  }

  /// Read up to the last `limit` records of a session's log, in file order.
  /// Malformed lines are skipped.
  pub async fn read_logs(&self, id: &str, limit: usize) -> Result<Vec<LogRecord>> {
    let meta = self
      .read(id)
      .await
      .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
    let raw = match fs::read_to_string(&meta.logs_path).await {
      Ok(raw) => raw,
      Err(_) => return Ok(Vec::new()),
    };
    let records: Vec<LogRecord> = raw
      .lines()
      .filter_map(|line| serde_json::from_str(line).ok())
      .collect();
    let skip = records.len().saturating_sub(limit);
    Ok(records.into_iter().skip(skip).collect())
  }

  /// Cached route report of a session, if one has been written.
  pub async fn read_report(&self, id: &str) -> Option<RouteReport> {
    let raw = fs::read(self.dir_for(id).join(REPORT_FILE)).await.ok()?;
    serde_json::from_slice(&raw).ok()
  }

  /// Cache a route report next to the session's log.
  pub async fn write_report(&self, id: &str, report: &RouteReport) -> Result<()> {
    let path = self.dir_for(id).join(REPORT_FILE);
    let raw = serde_json::to_vec_pretty(report)?;
    fs::write(path, raw).await?;
    Ok(())
  }

  /// Remove a stored session directory. Refused for the current session.
  pub async fn delete(&self, id: &str) -> Result<()> {
    let current = self.current.lock().await;
    if current.as_ref().is_some_and(|c| c.meta.id == id) {
      return Err(Error::SessionActive(id.to_string()));
    }
    drop(current);
    let dir = self.dir_for(id);
    if !dir.is_dir() {
      return Err(Error::SessionNotFound(id.to_string()));
    }
    fs::remove_dir_all(dir).await?;
    Ok(())
  }
}

async fn write_meta(dir: &Path, meta: &SessionMeta) -> Result<()> {
  let raw = serde_json::to_vec_pretty(meta)?;
  fs::write(dir.join(META_FILE), raw).await?;
  Ok(())
}

async fn finish(mut session: CurrentSession) -> Result<SessionMeta> {
  session.meta.ended_at = Some(now_ms());
  let dir = PathBuf::from(&session.meta.dir);
  session.file.flush().await?;
  write_meta(&dir, &session.meta).await?;
  // dropping the handle closes the log file
  Ok(session.meta)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("seine-session-{}-{}", tag, new_id()))
  }

  fn record(path: &str) -> LogRecord {
    let uri: http::Uri = format!("http://h{}", path).parse().unwrap();
    LogRecord::begin(&http::Method::GET, &uri)
  }

  #[tokio::test]
  async fn start_append_stop_roundtrip() {
    let root = temp_root("roundtrip");
    let store = SessionStore::new(&root);
    store.init().await.unwrap();

    let meta = store.start(Some("checkout".into()), Some("/api".into())).await.unwrap();
    assert_eq!(meta.name, "checkout");
    assert_eq!(meta.route_key.as_deref(), Some("/api"));

    for n in 0..3 {
      store.append(&record(&format!("/r/{}", n))).await.unwrap();
    }
    let stopped = store.stop().await.unwrap().unwrap();
    assert_eq!(stopped.log_count, 3);
    assert!(stopped.ended_at.is_some());

    // log line count matches logCount after stop
    let raw = std::fs::read_to_string(&stopped.logs_path).unwrap();
    assert_eq!(raw.lines().count(), 3);

    let logs = store.read_logs(&stopped.id, 10).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].path, "/r/0");

    std::fs::remove_dir_all(&root).ok();
  }

  #[tokio::test]
  async fn append_without_session_is_noop() {
    let root = temp_root("noop");
    let store = SessionStore::new(&root);
    store.init().await.unwrap();
    store.append(&record("/x")).await.unwrap();
    assert!(store.current().await.is_none());
    std::fs::remove_dir_all(&root).ok();
  }

  #[tokio::test]
  async fn start_stops_previous_session() {
    let root = temp_root("restart");
    let store = SessionStore::new(&root);
    store.init().await.unwrap();
    let first = store.start(Some("a".into()), None).await.unwrap();
    let second = store.start(Some("b".into()), None).await.unwrap();
    assert_ne!(first.id, second.id);

    let first_meta = store.read(&first.id).await.unwrap();
    assert!(first_meta.ended_at.is_some());
    assert_eq!(store.current().await.unwrap().id, second.id);
    store.stop().await.unwrap();
    std::fs::remove_dir_all(&root).ok();
  }

  #[tokio::test]
  async fn list_is_newest_first_and_skips_garbage() {
    let root = temp_root("list");
    let store = SessionStore::new(&root);
    store.init().await.unwrap();
    store.start(Some("one".into()), None).await.unwrap();
    store.stop().await.unwrap();
    store.start(Some("two".into()), None).await.unwrap();
    store.stop().await.unwrap();
    // a directory without meta.json must be skipped
    std::fs::create_dir_all(root.join("stray")).unwrap();

    let sessions = store.list().await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions[0].created_at >= sessions[1].created_at);
    std::fs::remove_dir_all(&root).ok();
  }

  #[tokio::test]
  async fn read_logs_skips_malformed_lines_and_limits() {
    let root = temp_root("malformed");
    let store = SessionStore::new(&root);
    store.init().await.unwrap();
    let meta = store.start(None, None).await.unwrap();
    for n in 0..5 {
      store.append(&record(&format!("/n/{}", n))).await.unwrap();
    }
    store.stop().await.unwrap();

    // corrupt the middle of the file
    use std::io::Write as _;
    let mut file = std::fs::OpenOptions::new()
      .append(true)
      .open(&meta.logs_path)
      .unwrap();
    writeln!(file, "{{broken").unwrap();

    let logs = store.read_logs(&meta.id, 2).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].path, "/n/4");
    std::fs::remove_dir_all(&root).ok();
  }

  #[tokio::test]
  async fn delete_refuses_current_session() {
    let root = temp_root("delete");
    let store = SessionStore::new(&root);
    store.init().await.unwrap();
    let meta = store.start(None, None).await.unwrap();
    assert!(matches!(
      store.delete(&meta.id).await,
      Err(Error::SessionActive(_))
    ));
    store.stop().await.unwrap();
    store.delete(&meta.id).await.unwrap();
    assert!(store.read(&meta.id).await.is_none());
    std::fs::remove_dir_all(&root).ok();
  }

  #[tokio::test]
  async fn report_cache_roundtrip() {
    let root = temp_root("report");
    let store = SessionStore::new(&root);
    store.init().await.unwrap();
    let meta = store.start(Some("r".into()), None).await.unwrap();
    store.append(&record("/a")).await.unwrap();
    store.stop().await.unwrap();

    assert!(store.read_report(&meta.id).await.is_none());
    let logs = store.read_logs(&meta.id, 100).await.unwrap();
    let report = crate::report::build_report("r", &meta.id, &logs);
    store.write_report(&meta.id, &report).await.unwrap();
    let cached = store.read_report(&meta.id).await.unwrap();
    assert_eq!(cached.total_logs, 1);
    std::fs::remove_dir_all(&root).ok();
  }
}
