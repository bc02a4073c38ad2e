//! Plain-HTTP forward proxying with capture.
//!
//! One call handles one exchange: resolve the target, relay the request
//! upstream and the response back down, tee both bodies into bounded side
//! buffers, and emit exactly one LogRecord once the exchange reaches a
//! terminal state (body end, upstream failure, or timeout). The failure
//! responder runs at most once; after response headers are on the wire a
//! failing exchange is torn down instead of answered.

use std::time::{Duration, Instant};

use http::header::{HeaderValue, CONNECTION, HOST};
use http::{StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use seine::{BodyCapture, CapturedResponse, LogRecord};

use crate::codec::{
  self, headers_to_map, query_map, request_body_kind, response_body_kind, strip_hop_by_hop,
  BodyKind, BodyTee, RelayError, RequestHead,
};
use crate::error::{Error, Result};
use crate::server::ProxyContext;

/// Hard deadline for reaching the upstream response head.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// What to do with the client connection after an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
  KeepAlive,
  Close,
}

/// Handle one non-CONNECT exchange on an accepted client connection.
///
/// `scheme`/`authority` describe the implied origin for origin-form
/// targets: plain proxying passes `http` and no authority (the `Host`
/// header decides), the MITM path passes `https` and the CONNECT target.
pub async fn handle_exchange<S>(
  client: &mut BufReader<S>,
  head: RequestHead,
  scheme: &str,
  authority: Option<&str>,
  ctx: &ProxyContext,
) -> Result<Persistence>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let Some(uri) = resolve_target(&head, scheme, authority) else {
    respond_bad_request(client).await?;
    return Ok(Persistence::Close);
  };
  let target_scheme = uri.scheme_str().unwrap_or("http").to_string();
  let host = uri.host().unwrap_or_default().to_string();
  let port = uri
    .port_u16()
    .unwrap_or(if target_scheme == "https" { 443 } else { 80 });
  let origin_target = uri
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());

  let started = Instant::now();
  let mut record = LogRecord::begin(&head.method, &uri);
  record.request.query = query_map(&uri);

  let client_wants_close = wants_close(&head.headers);
  let request_kind = request_body_kind(&head.headers);

  // hop-by-hop headers never reach the upstream or the record
  let mut upstream_headers = head.headers.clone();
  strip_hop_by_hop(&mut upstream_headers);
  let authority_value = seine::record::authority_host(&uri);
  if let Ok(value) = HeaderValue::from_str(&authority_value) {
    upstream_headers.insert(HOST, value);
  }
  record.request.headers = headers_to_map(&upstream_headers);

  let mut wire_headers = upstream_headers;
  if request_kind == BodyKind::Chunked {
    wire_headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
  }
  wire_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

  // connect, send, and wait for the response head under one deadline
  let sent = tokio::time::timeout(UPSTREAM_TIMEOUT, async {
    let mut upstream = ctx.pool.checkout(&target_scheme, &host, port).await?;
    codec::write_request_head(
      upstream.stream.get_mut(),
      &head.method,
      &origin_target,
      &wire_headers,
    )
    .await
    .map_err(|e| Error::upstream(format!("failed to send request head: {}", e)))?;

    let mut request_tee = BodyTee::new(ctx.config.body_limit);
    codec::relay_body(client, upstream.stream.get_mut(), request_kind, &mut request_tee)
      .await
      .map_err(|err| match err {
        RelayError::Read(e) => Error::client_closed(format!("client body read: {}", e)),
        RelayError::Write(e) => Error::upstream(format!("request body relay: {}", e)),
        RelayError::Protocol(msg) => Error::invalid_request(msg),
      })?;

    let response_head = codec::read_response_head(&mut upstream.stream)
      .await
      .map_err(|e| Error::upstream(format!("failed to read response head: {}", e)))?;
    Ok::<_, Error>((upstream, request_tee, response_head))
  })
  .await;

  let (mut upstream, request_tee, response_head) = match sent {
    Ok(Ok(parts)) => parts,
    Ok(Err(err)) => {
      return fail_before_headers(client, record, started, err, ctx).await;
    }
    Err(_) => {
      return fail_before_headers(client, record, started, Error::UpstreamTimeout, ctx).await;
    }
  };

  let status = response_head.status;
  let response_kind = response_body_kind(&head.method, status, &response_head.headers);
  let upstream_wants_close = wants_close(&response_head.headers);

  let mut response_headers = response_head.headers.clone();
  strip_hop_by_hop(&mut response_headers);
  let captured_response_headers = headers_to_map(&response_headers);

  let close_client = client_wants_close || response_kind == BodyKind::Close;
  let mut wire_response = response_headers;
  if response_kind == BodyKind::Chunked {
    wire_response.insert("transfer-encoding", HeaderValue::from_static("chunked"));
  }
  wire_response.insert(
    CONNECTION,
    HeaderValue::from_static(if close_client { "close" } else { "keep-alive" }),
  );

  // headers go on the wire now; from here failures tear down, never 502
  if let Err(err) = codec::write_response_head(
    client.get_mut(),
    status,
    &response_head.reason,
    &wire_response,
  )
  .await
  {
    return Err(Error::client_closed(format!("response head write: {}", err)));
  }

  let mut response_tee = BodyTee::new(ctx.config.body_limit);
  let relayed = codec::relay_body(
    &mut upstream.stream,
    client.get_mut(),
    response_kind,
    &mut response_tee,
  )
  .await;

  match relayed {
    Ok(_) => {}
    Err(RelayError::Write(e)) => {
      // client went away mid-body: quiet teardown, no record
      return Err(Error::client_closed(format!("response body write: {}", e)));
    }
    Err(RelayError::Read(e)) => {
      emit_failure(ctx, record, started, &Error::upstream(format!("response body: {}", e)));
      return Ok(Persistence::Close);
    }
    Err(RelayError::Protocol(msg)) => {
      emit_failure(ctx, record, started, &Error::upstream(msg));
      return Ok(Persistence::Close);
    }
  }

  // terminal success: fill in the record and emit once
  record.status = Some(status.as_u16());
  record.duration_ms = Some(started.elapsed().as_millis() as u64);
  let request_mime = seine::record::header_get(&record.request.headers, "content-type")
    .map(|v| v.to_string());
  let request_bytes = request_tee.into_bytes();
  record.request.body = if request_bytes.is_empty() {
    None
  } else {
    BodyCapture::from_bytes(request_mime, &request_bytes, ctx.config.body_limit)
  };
  let response_mime = captured_response_headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
    .map(|(_, v)| v.clone());
  let response_bytes = response_tee.into_bytes();
  record.response = Some(CapturedResponse {
    headers: Some(captured_response_headers),
    body: if response_bytes.is_empty() {
      None
    } else {
      BodyCapture::from_bytes(response_mime, &response_bytes, ctx.config.body_limit)
    },
  });
  ctx.pipeline.publish(record);

  let upstream_reusable =
    !upstream_wants_close && matches!(response_kind, BodyKind::Length(_) | BodyKind::Chunked | BodyKind::None);
  if upstream_reusable {
    ctx.pool.checkin(upstream);
  }

  Ok(if close_client {
    Persistence::Close
  } else {
    Persistence::KeepAlive
  })
}

/// Resolve the request target to an absolute URI, or `None` for a 400.
fn resolve_target(head: &RequestHead, scheme: &str, authority: Option<&str>) -> Option<Uri> {
  if head.target.starts_with("http://") || head.target.starts_with("https://") {
    let uri: Uri = head.target.parse().ok()?;
    uri.host()?;
    return Some(uri);
  }
  if head.target.starts_with('/') {
    let authority = match authority {
      Some(authority) => authority.to_string(),
      None => head
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())?
        .to_string(),
    };
    let url = format!("{}://{}{}", scheme, authority, head.target);
    let uri: Uri = url.parse().ok()?;
    uri.host()?;
    return Some(uri);
  }
  None
}

fn wants_close(headers: &http::HeaderMap) -> bool {
  headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// 400 for client framing errors; no record is emitted.
pub(crate) async fn respond_bad_request<S>(client: &mut BufReader<S>) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let body = b"Bad Request: expected an absolute-form proxy request or a Host header\n";
  let head = format!(
    "HTTP/1.1 400 Bad Request\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
    body.len()
  );
  let writer = client.get_mut();
  writer.write_all(head.as_bytes()).await?;
  writer.write_all(body).await?;
  writer.flush().await?;
  Ok(())
}

/// Failure before any response byte reached the client: answer 502 (unless
/// the client itself is gone) and emit the minimal failure record.
async fn fail_before_headers<S>(
  client: &mut BufReader<S>,
  record: LogRecord,
  started: Instant,
  err: Error,
  ctx: &ProxyContext,
) -> Result<Persistence>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  if err.is_client_disconnect() {
    // client abort cancels the upstream quietly
    return Err(err);
  }
  let body = format!("Bad Gateway: {}\n", err);
  let head = format!(
    "HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
    body.len()
  );
  let writer = client.get_mut();
  let wrote = async {
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
  }
  .await;
  if let Err(write_err) = wrote {
    tracing::debug!("could not deliver 502: {}", write_err);
  }
  emit_failure(ctx, record, started, &err);
  Ok(Persistence::Close)
}

/// The minimal LogRecord for an upstream failure: `status = 502` with the
/// error text as the response body.
fn emit_failure(ctx: &ProxyContext, mut record: LogRecord, started: Instant, err: &Error) {
  record.status = Some(StatusCode::BAD_GATEWAY.as_u16());
  record.duration_ms = Some(started.elapsed().as_millis() as u64);
  record.response = Some(CapturedResponse {
    headers: None,
    body: Some(BodyCapture {
      mime: Some("text/plain".to_string()),
      text: Some(err.to_string()),
    }),
  });
  ctx.pipeline.publish(record);
}
