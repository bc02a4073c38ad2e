//! Integration tests for the seine proxy data plane.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use seine::{LogRecord, LogRing, SessionStore, MASK};
use seine_proxy::upstream::UpstreamPool;
use seine_proxy::{
  CapturePipeline, CertificateAuthority, ProxyConfig, ProxyContext, ProxyServer,
};

struct Harness {
  proxy_addr: SocketAddr,
  ring: LogRing,
  store: Arc<SessionStore>,
  pipeline: CapturePipeline,
  ca: Option<Arc<CertificateAuthority>>,
  root: PathBuf,
}

impl Drop for Harness {
  fn drop(&mut self) {
    std::fs::remove_dir_all(&self.root).ok();
  }
}

async fn spawn_proxy(body_limit: usize) -> Harness {
  spawn_proxy_inner(body_limit, false).await
}

async fn spawn_mitm_proxy() -> Harness {
  spawn_proxy_inner(64 * 1024, true).await
}

async fn spawn_proxy_inner(body_limit: usize, mitm: bool) -> Harness {
  let root = std::env::temp_dir().join(format!("seine-it-{}", seine::record::new_id()));
  let store = Arc::new(SessionStore::new(root.join("sessions")));
  store.init().await.unwrap();
  let ring = LogRing::new(100);
  let pipeline = CapturePipeline::new(ring.clone(), store.clone());
  let (ca, pool) = if mitm {
    let ca = Arc::new(CertificateAuthority::open(root.join("certs")).await.unwrap());
    // the pool trusts the test CA so upstream TLS servers can present
    // leaves issued by it
    let pool = UpstreamPool::with_extra_roots(vec![pem_to_der(ca.ca_pem())]);
    (Some(ca), pool)
  } else {
    (None, UpstreamPool::new())
  };
  let config = ProxyConfig {
    body_limit,
    mitm,
    ca_dir: root.join("certs"),
    data_dir: root.join("sessions"),
    ..ProxyConfig::default()
  };
  let ctx = Arc::new(ProxyContext {
    config,
    pipeline: pipeline.clone(),
    pool,
    ca: ca.clone(),
    active: AtomicUsize::new(0),
  });
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let proxy_addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    ProxyServer::new(ctx).run(listener).await.ok();
  });
  Harness {
    proxy_addr,
    ring,
    store,
    pipeline,
    ca,
    root,
  }
}

fn pem_to_der(pem: &str) -> CertificateDer<'static> {
  rustls_pemfile::certs(&mut pem.as_bytes())
    .next()
    .unwrap()
    .unwrap()
}

/// Serve HTTP on any stream: answer 200 and echo the request head that was
/// seen as the response body (for asserting what actually crossed the wire).
async fn serve_echo_http<S>(stream: S)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let (read, mut write) = tokio::io::split(stream);
  let mut reader = BufReader::new(read);
  loop {
    let mut head = String::new();
    loop {
      let mut line = String::new();
      if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
        return;
      }
      if line == "\r\n" {
        break;
      }
      head.push_str(&line);
    }
    let content_length = head
      .lines()
      .find_map(|line| {
        line
          .to_ascii_lowercase()
          .strip_prefix("content-length:")
          .map(|v| v.trim().parse::<usize>().unwrap_or(0))
      })
      .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 && reader.read_exact(&mut body).await.is_err() {
      return;
    }
    let payload = format!("SEEN\n{}", head);
    let response = format!(
      "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{}",
      payload.len(),
      payload
    );
    if write.write_all(response.as_bytes()).await.is_err() {
      return;
    }
  }
}

/// A plain-HTTP echo upstream.
async fn spawn_upstream() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((socket, _)) = listener.accept().await {
      tokio::spawn(serve_echo_http(socket));
    }
  });
  addr
}

/// An HTTPS echo upstream presenting a leaf issued by the given CA.
async fn spawn_tls_upstream(ca: &CertificateAuthority) -> SocketAddr {
  let (chain, key) = ca.issue_leaf("127.0.0.1").unwrap();
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((socket, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(socket).await {
          serve_echo_http(tls).await;
        }
      });
    }
  });
  addr
}

/// Send raw bytes to the proxy and collect everything until it closes.
async fn roundtrip(proxy: SocketAddr, request: String) -> String {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  String::from_utf8_lossy(&response).into_owned()
}

/// Read the `200 Connection Established` head off a CONNECT reply.
async fn read_established(stream: &mut TcpStream) {
  let mut seen = Vec::new();
  let mut byte = [0u8; 1];
  while !seen.ends_with(b"\r\n\r\n") {
    stream.read_exact(&mut byte).await.unwrap();
    seen.push(byte[0]);
  }
  assert!(
    String::from_utf8_lossy(&seen).starts_with("HTTP/1.1 200 Connection Established"),
    "unexpected CONNECT reply: {:?}",
    String::from_utf8_lossy(&seen)
  );
}

/// Read one HTTP response by its Content-Length framing (no reliance on a
/// clean EOF, which TLS teardown does not guarantee).
async fn read_http_response<S>(stream: S) -> String
where
  S: AsyncRead + Unpin,
{
  let mut reader = BufReader::new(stream);
  let mut head = String::new();
  loop {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let done = line == "\r\n";
    head.push_str(&line);
    if done {
      break;
    }
  }
  let content_length = head
    .lines()
    .find_map(|line| {
      line
        .to_ascii_lowercase()
        .strip_prefix("content-length:")
        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
    })
    .unwrap_or(0);
  let mut body = vec![0u8; content_length];
  reader.read_exact(&mut body).await.unwrap();
  format!("{}{}", head, String::from_utf8_lossy(&body))
}

/// Wait for the ring to hold `count` records.
async fn wait_for_records(ring: &LogRing, count: usize) -> Vec<LogRecord> {
  for _ in 0..100 {
    if ring.len() >= count {
      return ring.snapshot(count);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("ring never reached {} record(s)", count);
}

#[tokio::test]
async fn absolute_form_exchange_is_relayed_and_captured() {
  let upstream = spawn_upstream().await;
  let harness = spawn_proxy(64 * 1024).await;

  let response = roundtrip(
    harness.proxy_addr,
    format!(
      "GET http://127.0.0.1:{}/widgets?id=7 HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
      upstream.port(),
      upstream.port()
    ),
  )
  .await;

  assert!(response.starts_with("HTTP/1.1 200 OK"));
  assert!(response.contains("SEEN"));
  // the upstream saw an origin-form target
  assert!(response.contains("GET /widgets?id=7 HTTP/1.1"));

  let records = wait_for_records(&harness.ring, 1).await;
  let record = &records[0];
  assert_eq!(record.method, "GET");
  assert_eq!(record.status, Some(200));
  assert_eq!(record.path, "/widgets");
  assert_eq!(record.host, format!("127.0.0.1:{}", upstream.port()));
  assert_eq!(record.request.query.as_ref().unwrap()["id"], "7");
  assert!(record.duration_ms.is_some());
  let body = record.response.as_ref().unwrap().body.as_ref().unwrap();
  assert_eq!(body.mime.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn origin_form_uses_host_header() {
  let upstream = spawn_upstream().await;
  let harness = spawn_proxy(64 * 1024).await;

  let response = roundtrip(
    harness.proxy_addr,
    format!(
      "GET /by-host HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
      upstream.port()
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200 OK"));

  let records = wait_for_records(&harness.ring, 1).await;
  assert_eq!(
    records[0].url,
    format!("http://127.0.0.1:{}/by-host", upstream.port())
  );
}

#[tokio::test]
async fn hop_by_hop_headers_do_not_reach_upstream_or_record() {
  let upstream = spawn_upstream().await;
  let harness = spawn_proxy(64 * 1024).await;

  let response = roundtrip(
    harness.proxy_addr,
    format!(
      "GET http://127.0.0.1:{}/h HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: X-Custom, close\r\nX-Custom: v\r\nProxy-Connection: keep-alive\r\nX-Trace: t1\r\n\r\n",
      upstream.port(),
      upstream.port()
    ),
  )
  .await;

  // the echoed upstream head must contain neither the listed nor the fixed set
  let seen = response.split("SEEN\n").nth(1).unwrap_or_default().to_ascii_lowercase();
  assert!(!seen.contains("x-custom"));
  assert!(!seen.contains("proxy-connection"));
  assert!(seen.contains("x-trace: t1"));

  let records = wait_for_records(&harness.ring, 1).await;
  let headers = &records[0].request.headers;
  assert!(headers.keys().all(|k| {
    !["connection", "proxy-connection", "keep-alive", "transfer-encoding", "te", "trailer", "upgrade"]
      .contains(&k.as_str())
  }));
  assert!(headers.contains_key("x-trace"));
}

#[tokio::test]
async fn request_bodies_are_forwarded_and_sensitive_values_masked() {
  let upstream = spawn_upstream().await;
  let harness = spawn_proxy(64 * 1024).await;

  let body = r#"{"password":"hunter2","note":"ok"}"#;
  let response = roundtrip(
    harness.proxy_addr,
    format!(
      "POST http://127.0.0.1:{}/login HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nAuthorization: Bearer abc\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
      upstream.port(),
      upstream.port(),
      body.len(),
      body
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200 OK"));

  let records = wait_for_records(&harness.ring, 1).await;
  let record = &records[0];
  assert_eq!(record.request.headers["authorization"], MASK);
  let text = record
    .request
    .body
    .as_ref()
    .unwrap()
    .text
    .as_ref()
    .unwrap();
  assert!(text.contains(MASK));
  assert!(!text.contains("hunter2"));
  assert!(text.contains("\"note\": \"ok\""));
}

#[tokio::test]
async fn upstream_refusal_yields_502_and_failure_record() {
  let harness = spawn_proxy(64 * 1024).await;
  // bind-then-drop: nothing listens on this port
  let dead_port = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
  };

  let response = roundtrip(
    harness.proxy_addr,
    format!(
      "GET http://127.0.0.1:{}/x HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
      dead_port, dead_port
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));

  let records = wait_for_records(&harness.ring, 1).await;
  let record = &records[0];
  assert_eq!(record.status, Some(502));
  let text = record
    .response
    .as_ref()
    .unwrap()
    .body
    .as_ref()
    .unwrap()
    .text
    .as_ref()
    .unwrap();
  assert!(text.contains("Upstream"));
}

#[tokio::test]
async fn bad_target_gets_400_and_no_record() {
  let harness = spawn_proxy(64 * 1024).await;
  let response = roundtrip(
    harness.proxy_addr,
    "GET /no-host-anywhere HTTP/1.1\r\nConnection: close\r\n\r\n".to_string(),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(harness.ring.is_empty());
}

#[tokio::test]
async fn connect_tunnel_relays_and_logs_exactly_once() {
  // raw TCP echo upstream
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut socket, _)) = listener.accept().await {
      tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok(n) = socket.read(&mut buf).await {
          if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
            break;
          }
        }
      });
    }
  });

  let harness = spawn_proxy(64 * 1024).await;
  let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream.port()).as_bytes())
    .await
    .unwrap();
  read_established(&mut stream).await;

  // tunneled bytes are echoed back untouched
  stream.write_all(b"ping through tunnel").await.unwrap();
  let mut echo = [0u8; 19];
  stream.read_exact(&mut echo).await.unwrap();
  assert_eq!(&echo, b"ping through tunnel");

  let records = wait_for_records(&harness.ring, 1).await;
  let record = &records[0];
  assert_eq!(record.method, "CONNECT");
  assert_eq!(record.url, format!("https://127.0.0.1:{}", upstream.port()));
  assert_eq!(record.status, Some(200));
  // no body is observed in tunnel mode
  assert!(record.request.body.is_none());
  assert!(record.response.as_ref().map_or(true, |r| r.body.is_none()));

  drop(stream);
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(harness.ring.len(), 1, "tunnel must emit exactly one record");
}

#[tokio::test]
async fn mitm_terminates_tls_and_captures_decrypted_exchange() {
  let harness = spawn_mitm_proxy().await;
  let ca = harness.ca.as_ref().unwrap();
  let upstream = spawn_tls_upstream(ca).await;

  let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream.port()).as_bytes())
    .await
    .unwrap();
  read_established(&mut stream).await;

  // the client trusts the proxy CA, so the handshake lands on the
  // dynamically issued leaf
  let mut roots = RootCertStore::empty();
  roots.add(pem_to_der(ca.ca_pem())).unwrap();
  let client_config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let server_name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
  let mut tls = connector.connect(server_name, stream).await.unwrap();

  tls
    .write_all(
      format!(
        "GET /secure HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        upstream.port()
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  let response = read_http_response(tls).await;
  assert!(response.starts_with("HTTP/1.1 200 OK"));
  // the decrypted request was re-originated against the TLS upstream
  assert!(response.contains("SEEN"));
  assert!(response.contains("GET /secure HTTP/1.1"));

  let records = wait_for_records(&harness.ring, 1).await;
  let record = &records[0];
  assert_eq!(record.method, "GET");
  assert_eq!(record.status, Some(200));
  assert_eq!(
    record.url,
    format!("https://127.0.0.1:{}/secure", upstream.port())
  );
  assert!(record.url.starts_with("https://"));
}

#[tokio::test]
async fn mitm_survives_clients_that_reject_the_ca() {
  let harness = spawn_mitm_proxy().await;
  let upstream = spawn_upstream().await;

  let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
  stream
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  read_established(&mut stream).await;

  // an empty root store: this client refuses the proxy's certificate
  let client_config = ClientConfig::builder()
    .with_root_certificates(RootCertStore::empty())
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let server_name = ServerName::try_from("example.com".to_string()).unwrap();
  let result = connector.connect(server_name, stream).await;
  assert!(result.is_err(), "handshake must fail without CA trust");

  // the failed handshake emits nothing and the proxy keeps serving
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(harness.ring.is_empty());
  let response = roundtrip(
    harness.proxy_addr,
    format!(
      "GET http://127.0.0.1:{}/alive HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
      upstream.port(),
      upstream.port()
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200 OK"));
  wait_for_records(&harness.ring, 1).await;
}

#[tokio::test]
async fn response_bodies_are_clipped_to_the_limit() {
  let upstream = spawn_upstream().await;
  let harness = spawn_proxy(32).await;

  let response = roundtrip(
    harness.proxy_addr,
    format!(
      "GET http://127.0.0.1:{}/long-response-path-to-pad-the-echo HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
      upstream.port(),
      upstream.port()
    ),
  )
  .await;
  // the client still receives the full body
  assert!(response.contains("SEEN"));

  let records = wait_for_records(&harness.ring, 1).await;
  let text = records[0]
    .response
    .as_ref()
    .unwrap()
    .body
    .as_ref()
    .unwrap()
    .text
    .as_ref()
    .unwrap();
  assert!(text.len() <= 32);
}

#[tokio::test]
async fn captures_append_to_the_active_session() {
  let upstream = spawn_upstream().await;
  let harness = spawn_proxy(64 * 1024).await;
  let meta = harness
    .pipeline
    .start_session(Some("it".into()), None)
    .await
    .unwrap();

  roundtrip(
    harness.proxy_addr,
    format!(
      "GET http://127.0.0.1:{}/persisted HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
      upstream.port(),
      upstream.port()
    ),
  )
  .await;
  wait_for_records(&harness.ring, 1).await;

  // stop queues behind the published record, so the count is settled here
  let stopped = harness.pipeline.stop_session().await.unwrap().unwrap();
  assert_eq!(stopped.id, meta.id);
  assert_eq!(stopped.log_count, 1);

  let persisted = harness.store.read_logs(&meta.id, 10).await.unwrap();
  assert_eq!(persisted.len(), 1);
  assert_eq!(persisted[0].path, "/persisted");
}
