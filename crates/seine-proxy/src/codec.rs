//! HTTP/1.1 wire codec for the proxy data plane.
//!
//! Heads are parsed line-by-line off a buffered stream; bodies are relayed
//! with their original framing (Content-Length, chunked, or read-to-close)
//! while a bounded tee copies the first slice for capture. The relay never
//! buffers a full body and never delays bytes on the wire.

use std::collections::BTreeMap;
use std::io;

use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on a request/response head (start line + headers).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const RELAY_CHUNK: usize = 8 * 1024;

/// Hop-by-hop header names a forward proxy must not relay (RFC 7230 §6.1),
/// always stripped in addition to anything the `Connection` header lists.
pub const HOP_BY_HOP: [&str; 7] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "transfer-encoding",
  "te",
  "trailer",
  "upgrade",
];

/// Parsed request start line + headers.
#[derive(Debug)]
pub struct RequestHead {
  pub method: Method,
  /// Raw request target: absolute-form, origin-form, or authority-form.
  pub target: String,
  pub headers: HeaderMap,
}

/// Parsed response start line + headers.
#[derive(Debug)]
pub struct ResponseHead {
  pub status: StatusCode,
  pub reason: String,
  pub headers: HeaderMap,
}

/// Body framing of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
  /// No body bytes follow the head.
  None,
  /// Exactly this many bytes follow.
  Length(u64),
  /// Chunked transfer coding.
  Chunked,
  /// Body runs until the peer closes the connection.
  Close,
}

/// Errors during body relay, split by side so the proxy can tell a dying
/// upstream from a client that went away.
#[derive(Debug)]
pub enum RelayError {
  Read(io::Error),
  Write(io::Error),
  Protocol(String),
}

/// Read a request head. `Ok(None)` on clean EOF before the first byte
/// (client closed an idle keep-alive connection).
pub async fn read_request_head<R>(reader: &mut R) -> io::Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  // tolerate stray blank lines between pipelined requests
  let line = loop {
    let Some(line) = read_head_line(reader, true).await? else {
      return Ok(None);
    };
    if !line.is_empty() {
      break line;
    }
  };

  let mut parts = line.split_whitespace();
  let (method, target) = match (parts.next(), parts.next(), parts.next()) {
    (Some(method), Some(target), Some(_version)) => (method, target),
    _ => return Err(invalid_data("malformed request line")),
  };
  let method: Method = method
    .parse()
    .map_err(|_| invalid_data("unknown method"))?;
  let headers = read_header_block(reader).await?;
  Ok(Some(RequestHead {
    method,
    target: target.to_string(),
    headers,
  }))
}

/// Read a response head.
pub async fn read_response_head<R>(reader: &mut R) -> io::Result<ResponseHead>
where
  R: AsyncBufRead + Unpin,
{
  let line = read_head_line(reader, false)
    .await?
    .ok_or_else(|| invalid_data("upstream closed before status line"))?;
  let mut parts = line.splitn(3, ' ');
  let _version = parts.next().unwrap_or_default();
  let status = parts
    .next()
    .and_then(|code| code.parse::<u16>().ok())
    .and_then(|code| StatusCode::from_u16(code).ok())
    .ok_or_else(|| invalid_data("malformed status line"))?;
  let reason = parts.next().unwrap_or_default().to_string();
  let headers = read_header_block(reader).await?;
  Ok(ResponseHead {
    status,
    reason,
    headers,
  })
}

/// One CRLF-terminated head line, bounded. `Ok(None)` on EOF with zero
/// bytes read (only when `eof_ok`).
async fn read_head_line<R>(reader: &mut R, eof_ok: bool) -> io::Result<Option<String>>
where
  R: AsyncBufRead + Unpin,
{
  let mut raw = Vec::new();
  let n = reader.read_until(b'\n', &mut raw).await?;
  if n == 0 {
    if eof_ok {
      return Ok(None);
    }
    return Err(invalid_data("unexpected EOF in head"));
  }
  if raw.len() > MAX_HEAD_BYTES {
    return Err(invalid_data("head line too long"));
  }
  while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
    raw.pop();
  }
  String::from_utf8(raw).map(Some).map_err(|_| invalid_data("non-UTF-8 head line"))
}

async fn read_header_block<R>(reader: &mut R) -> io::Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut total = 0usize;
  loop {
    let line = read_head_line(reader, false)
      .await?
      .unwrap_or_default();
    if line.is_empty() {
      return Ok(headers);
    }
    total += line.len();
    if total > MAX_HEAD_BYTES {
      return Err(invalid_data("header block too large"));
    }
    let Some(colon) = line.find(':') else {
      continue; // skip malformed header lines rather than failing the exchange
    };
    let (name, value) = line.split_at(colon);
    let value = value[1..].trim();
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.trim().as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
}

/// Write a request head in origin-form.
pub async fn write_request_head<W>(
  writer: &mut W,
  method: &Method,
  target: &str,
  headers: &HeaderMap,
) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut head = format!("{} {} HTTP/1.1\r\n", method, target);
  append_headers(&mut head, headers);
  head.push_str("\r\n");
  writer.write_all(head.as_bytes()).await?;
  writer.flush().await
}

/// Write a response head, mirroring the upstream status and reason.
pub async fn write_response_head<W>(
  writer: &mut W,
  status: StatusCode,
  reason: &str,
  headers: &HeaderMap,
) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let reason = if reason.is_empty() {
    status.canonical_reason().unwrap_or("")
  } else {
    reason
  };
  let mut head = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason);
  append_headers(&mut head, headers);
  head.push_str("\r\n");
  writer.write_all(head.as_bytes()).await?;
  writer.flush().await
}

fn append_headers(head: &mut String, headers: &HeaderMap) {
  for (name, value) in headers.iter() {
    head.push_str(name.as_str());
    head.push_str(": ");
    head.push_str(String::from_utf8_lossy(value.as_bytes()).as_ref());
    head.push_str("\r\n");
  }
}

/// Body framing of a request head.
pub fn request_body_kind(headers: &HeaderMap) -> BodyKind {
  if is_chunked(headers) {
    return BodyKind::Chunked;
  }
  match content_length(headers) {
    Some(0) | None => BodyKind::None,
    Some(n) => BodyKind::Length(n),
  }
}

/// Body framing of a response head for a given request method.
pub fn response_body_kind(method: &Method, status: StatusCode, headers: &HeaderMap) -> BodyKind {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return BodyKind::None;
  }
  if is_chunked(headers) {
    return BodyKind::Chunked;
  }
  match content_length(headers) {
    Some(0) => BodyKind::None,
    Some(n) => BodyKind::Length(n),
    None => BodyKind::Close,
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

/// Remove every header the inbound `Connection` header names plus the
/// fixed hop-by-hop set.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(&name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}

/// Capture a header map: lowercase names, multi-values comma-joined.
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
  let mut map = BTreeMap::new();
  for name in headers.keys() {
    let joined = headers
      .get_all(name)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .collect::<Vec<_>>()
      .join(", ");
    map.insert(name.as_str().to_string(), joined);
  }
  map
}

/// Query string of a URI as a last-wins key → value map.
pub fn query_map(uri: &Uri) -> Option<BTreeMap<String, String>> {
  let query = uri.query()?;
  let mut map = BTreeMap::new();
  for pair in query.split('&').filter(|p| !p.is_empty()) {
    match pair.split_once('=') {
      Some((key, value)) => map.insert(key.to_string(), value.to_string()),
      None => map.insert(pair.to_string(), String::new()),
    };
  }
  Some(map)
}

/// Bounded side buffer for body capture. Takes an exact slice of the
/// chunk that crosses the limit and ignores everything after.
pub struct BodyTee {
  buf: Vec<u8>,
  limit: usize,
}

impl BodyTee {
  pub fn new(limit: usize) -> BodyTee {
    BodyTee {
      buf: Vec::new(),
      limit,
    }
  }

  pub fn absorb(&mut self, chunk: &[u8]) {
    let remaining = self.limit.saturating_sub(self.buf.len());
    if remaining > 0 {
      self.buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
  }

  pub fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.buf
  }
}

/// Relay a message body from `reader` to `writer` preserving its framing,
/// teeing bytes into `tee`. Returns the number of payload bytes relayed.
pub async fn relay_body<R, W>(
  reader: &mut R,
  writer: &mut W,
  kind: BodyKind,
  tee: &mut BodyTee,
) -> Result<u64, RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let relayed = match kind {
    BodyKind::None => 0,
    BodyKind::Length(total) => relay_exact(reader, writer, total, tee).await?,
    BodyKind::Close => relay_until_close(reader, writer, tee).await?,
    BodyKind::Chunked => relay_chunked(reader, writer, tee).await?,
  };
  writer.flush().await.map_err(RelayError::Write)?;
  Ok(relayed)
}

async fn relay_exact<R, W>(
  reader: &mut R,
  writer: &mut W,
  total: u64,
  tee: &mut BodyTee,
) -> Result<u64, RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = [0u8; RELAY_CHUNK];
  let mut remaining = total;
  while remaining > 0 {
    let want = remaining.min(RELAY_CHUNK as u64) as usize;
    let n = reader
      .read(&mut buf[..want])
      .await
      .map_err(RelayError::Read)?;
    if n == 0 {
      return Err(RelayError::Read(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "body ended early",
      )));
    }
    tee.absorb(&buf[..n]);
    writer.write_all(&buf[..n]).await.map_err(RelayError::Write)?;
    remaining -= n as u64;
  }
  Ok(total)
}

async fn relay_until_close<R, W>(
  reader: &mut R,
  writer: &mut W,
  tee: &mut BodyTee,
) -> Result<u64, RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = [0u8; RELAY_CHUNK];
  let mut relayed = 0u64;
  loop {
    let n = reader.read(&mut buf).await.map_err(RelayError::Read)?;
    if n == 0 {
      return Ok(relayed);
    }
    tee.absorb(&buf[..n]);
    writer.write_all(&buf[..n]).await.map_err(RelayError::Write)?;
    relayed += n as u64;
  }
}

async fn relay_chunked<R, W>(
  reader: &mut R,
  writer: &mut W,
  tee: &mut BodyTee,
) -> Result<u64, RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = [0u8; RELAY_CHUNK];
  let mut relayed = 0u64;
  loop {
    let size_line = read_chunk_line(reader).await?;
    let size_hex = size_line
      .split(';')
      .next()
      .unwrap_or_default()
      .trim()
      .to_string();
    let size = u64::from_str_radix(&size_hex, 16)
      .map_err(|_| RelayError::Protocol(format!("bad chunk size: {:?}", size_hex)))?;

    if size == 0 {
      // trailers run until the blank line; they are relayed verbatim
      let mut trailer_block = String::from("0\r\n");
      loop {
        let trailer = read_chunk_line(reader).await?;
        if trailer.is_empty() {
          break;
        }
        trailer_block.push_str(&trailer);
        trailer_block.push_str("\r\n");
      }
      trailer_block.push_str("\r\n");
      writer
        .write_all(trailer_block.as_bytes())
        .await
        .map_err(RelayError::Write)?;
      return Ok(relayed);
    }

    writer
      .write_all(format!("{:x}\r\n", size).as_bytes())
      .await
      .map_err(RelayError::Write)?;
    let mut remaining = size;
    while remaining > 0 {
      let want = remaining.min(RELAY_CHUNK as u64) as usize;
      let n = reader
        .read(&mut buf[..want])
        .await
        .map_err(RelayError::Read)?;
      if n == 0 {
        return Err(RelayError::Read(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "chunk ended early",
        )));
      }
      tee.absorb(&buf[..n]);
      writer.write_all(&buf[..n]).await.map_err(RelayError::Write)?;
      remaining -= n as u64;
      relayed += n as u64;
    }
    // chunk data is followed by CRLF
    let mut crlf = [0u8; 2];
    reader
      .read_exact(&mut crlf)
      .await
      .map_err(RelayError::Read)?;
    writer.write_all(b"\r\n").await.map_err(RelayError::Write)?;
  }
}

async fn read_chunk_line<R>(reader: &mut R) -> Result<String, RelayError>
where
  R: AsyncBufRead + Unpin,
{
  let mut raw = Vec::new();
  let n = reader
    .read_until(b'\n', &mut raw)
    .await
    .map_err(RelayError::Read)?;
  if n == 0 {
    return Err(RelayError::Read(io::Error::new(
      io::ErrorKind::UnexpectedEof,
      "EOF inside chunked body",
    )));
  }
  if raw.len() > MAX_HEAD_BYTES {
    return Err(RelayError::Protocol("chunk line too long".to_string()));
  }
  while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
    raw.pop();
  }
  String::from_utf8(raw).map_err(|_| RelayError::Protocol("non-UTF-8 chunk line".to_string()))
}

fn invalid_data(msg: &str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg)
}
