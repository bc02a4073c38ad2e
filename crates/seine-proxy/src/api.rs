//! Control/observer HTTP API.
//!
//! Serves the live ring, the session store, exports and the SSE event
//! stream on the observer port. Everything here is read/control plane;
//! the capture hot path never waits on these handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_core::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use seine::catalog::{build_catalog, report_for_session};
use seine::export::{catalog_markdown, session_markdown, to_har};
use seine::{LogRing, SessionStore};

use crate::pipeline::CapturePipeline;

/// Maximum `limit` for `/api/logs`.
const RING_QUERY_MAX: usize = 2000;
/// Maximum `limit` for `/api/sessions/{id}/logs`.
const SESSION_QUERY_MAX: usize = 5000;

/// State shared by every handler.
#[derive(Clone)]
pub struct ApiState {
  pub ring: LogRing,
  pub store: Arc<SessionStore>,
  /// Session start/stop go through the pipeline so they stay ordered with
  /// respect to in-flight record appends.
  pub pipeline: CapturePipeline,
  /// CA certificate PEM when MITM is enabled.
  pub ca_pem: Option<String>,
}

/// Build the observer router.
pub fn build_router(state: ApiState) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/api/logs", get(logs))
    .route("/api/clear", post(clear))
    .route("/events", get(events))
    .route("/api/sessions", get(sessions_index))
    .route("/api/sessions/start", post(session_start))
    .route("/api/sessions/stop", post(session_stop))
    .route("/api/sessions/{id}", get(session_show))
    .route("/api/sessions/{id}", delete(session_delete))
    .route("/api/sessions/{id}/logs", get(session_logs))
    .route("/api/sessions/{id}/export", get(session_export))
    .route("/api/sessions/{id}/report", post(session_report))
    .route("/api/catalog/export", get(catalog_export))
    .route("/api/ca", get(ca_pem))
    .with_state(state)
}

#[derive(Deserialize)]
struct LimitQuery {
  limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
  name: Option<String>,
  route_key: Option<String>,
}

#[derive(Deserialize)]
struct FormatQuery {
  format: Option<String>,
}

async fn health() -> Json<serde_json::Value> {
  Json(json!({ "ok": true }))
}

async fn logs(State(state): State<ApiState>, Query(query): Query<LimitQuery>) -> Response {
  let limit = query.limit.unwrap_or(RING_QUERY_MAX).min(RING_QUERY_MAX);
  Json(json!({ "items": state.ring.snapshot(limit) })).into_response()
}

async fn clear(State(state): State<ApiState>) -> Json<serde_json::Value> {
  state.ring.clear();
  Json(json!({ "ok": true }))
}

/// `hello` once, then one `log` event per emission. Missed events are not
/// replayed on reconnect.
async fn events(
  State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let rx = state.ring.subscribe().into_receiver();
  let hello = tokio_stream::once(Ok(Event::default().event("hello").data("{\"ok\":true}")));
  let stream = hello.chain(ReceiverStream::new(rx).map(|record| {
    let data = serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().event("log").data(data))
  }));
  Sse::new(stream).keep_alive(
    KeepAlive::new()
      .interval(Duration::from_secs(15))
      .text("ping"),
  )
}

async fn sessions_index(State(state): State<ApiState>) -> Response {
  let items = state.store.list().await.unwrap_or_default();
  let current = state.store.current().await;
  Json(json!({ "items": items, "current": current })).into_response()
}

async fn session_show(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
  match state.store.read(&id).await {
    Some(meta) => Json(meta).into_response(),
    None => not_found("session not found"),
  }
}

async fn session_start(State(state): State<ApiState>, body: axum::body::Bytes) -> Response {
  // an empty or non-JSON body simply means "all defaults"
  let body: StartBody = serde_json::from_slice(&body).unwrap_or(StartBody {
    name: None,
    route_key: None,
  });
  match state.pipeline.start_session(body.name, body.route_key).await {
    Ok(meta) => Json(meta).into_response(),
    Err(err) => internal_error(err),
  }
}

async fn session_stop(State(state): State<ApiState>) -> Response {
  match state.pipeline.stop_session().await {
    Ok(Some(meta)) => Json(meta).into_response(),
    Ok(None) => Json(json!({ "ok": true })).into_response(),
    Err(err) => internal_error(err),
  }
}

async fn session_delete(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
  match state.store.delete(&id).await {
    Ok(()) => Json(json!({ "ok": true })).into_response(),
    Err(seine::Error::SessionNotFound(_)) => not_found("session not found"),
    Err(seine::Error::SessionActive(_)) => {
      (StatusCode::CONFLICT, Json(json!({ "error": "session is active" }))).into_response()
    }
    Err(err) => internal_error(err),
  }
}

async fn session_logs(
  State(state): State<ApiState>,
  Path(id): Path<String>,
  Query(query): Query<LimitQuery>,
) -> Response {
  let limit = query
    .limit
    .unwrap_or(SESSION_QUERY_MAX)
    .min(SESSION_QUERY_MAX);
  match state.store.read_logs(&id, limit).await {
    Ok(items) => Json(json!({ "items": items })).into_response(),
    Err(seine::Error::SessionNotFound(_)) => not_found("session not found"),
    Err(err) => internal_error(err),
  }
}

async fn session_report(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
  let Some(meta) = state.store.read(&id).await else {
    return not_found("session not found");
  };
  let report = report_for_session(&state.store, &meta).await;
  Json(report).into_response()
}

async fn session_export(
  State(state): State<ApiState>,
  Path(id): Path<String>,
  Query(query): Query<FormatQuery>,
) -> Response {
  let Some(meta) = state.store.read(&id).await else {
    return not_found("session not found");
  };
  let logs = match state.store.read_logs(&id, SESSION_QUERY_MAX).await {
    Ok(logs) => logs,
    Err(err) => return internal_error(err),
  };
  match query.format.as_deref().unwrap_or("json") {
    "har" => download(
      format!("session-{}.har", meta.id),
      "application/json",
      serde_json::to_string_pretty(&to_har(&logs)).unwrap_or_default(),
    ),
    "md" => {
      let report = report_for_session(&state.store, &meta).await;
      download(
        format!("session-{}.md", meta.id),
        "text/markdown",
        session_markdown(&meta, &report),
      )
    }
    "json" => download(
      format!("session-{}.json", meta.id),
      "application/json",
      serde_json::to_string_pretty(&json!({ "session": meta, "logs": logs }))
        .unwrap_or_default(),
    ),
    other => (
      StatusCode::BAD_REQUEST,
      Json(json!({ "error": format!("unknown format: {}", other) })),
    )
      .into_response(),
  }
}

async fn catalog_export(
  State(state): State<ApiState>,
  Query(query): Query<FormatQuery>,
) -> Response {
  let catalog = build_catalog(&state.store).await;
  match query.format.as_deref().unwrap_or("json") {
    "md" => download(
      "catalog.md".to_string(),
      "text/markdown",
      catalog_markdown(&catalog),
    ),
    "json" => download(
      "catalog.json".to_string(),
      "application/json",
      serde_json::to_string_pretty(&catalog).unwrap_or_default(),
    ),
    other => (
      StatusCode::BAD_REQUEST,
      Json(json!({ "error": format!("unknown format: {}", other) })),
    )
      .into_response(),
  }
}

async fn ca_pem(State(state): State<ApiState>) -> Response {
  match state.ca_pem {
    Some(pem) => (
      [(header::CONTENT_TYPE, "application/x-pem-file")],
      pem,
    )
      .into_response(),
    None => not_found("MITM is disabled; no CA available"),
  }
}

fn download(filename: String, content_type: &'static str, body: String) -> Response {
  (
    [
      (header::CONTENT_TYPE, content_type.to_string()),
      (
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", filename),
      ),
    ],
    body,
  )
    .into_response()
}

fn not_found(msg: &str) -> Response {
  (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response()
}

fn internal_error(err: seine::Error) -> Response {
  (
    StatusCode::INTERNAL_SERVER_ERROR,
    Json(json!({ "error": err.to_string() })),
  )
    .into_response()
}
