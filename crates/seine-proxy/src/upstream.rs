//! Upstream connections: resolution, TLS, and a keep-alive pool.
//!
//! Sockets are pooled per `scheme://host:port` key so sequential exchanges
//! against the same origin reuse one connection. The pool keeps at most
//! [`MAX_IDLE_PER_HOST`] idle sockets per key and drops idle sockets after
//! a staleness window rather than risking a dead reuse.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Idle socket cap per host key.
pub const MAX_IDLE_PER_HOST: usize = 64;
/// Connect-phase timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle sockets older than this are discarded instead of reused.
const IDLE_MAX_AGE: Duration = Duration::from_secs(60);

/// A plain or TLS upstream stream.
pub enum UpstreamStream {
  Tcp(TcpStream),
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match self.get_mut() {
      UpstreamStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      UpstreamStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for UpstreamStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      UpstreamStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      UpstreamStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      UpstreamStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      UpstreamStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      UpstreamStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      UpstreamStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

/// One checked-out upstream connection.
pub struct UpstreamConn {
  pub stream: BufReader<UpstreamStream>,
  key: String,
}

impl UpstreamConn {
  pub fn key(&self) -> &str {
    &self.key
  }
}

struct IdleConn {
  conn: UpstreamConn,
  since: Instant,
}

/// Keep-alive connection pool with TLS support.
pub struct UpstreamPool {
  idle: std::sync::Mutex<HashMap<String, VecDeque<IdleConn>>>,
  tls: TlsConnector,
}

impl UpstreamPool {
  /// Build a pool whose TLS trust is the platform's native root store.
  pub fn new() -> UpstreamPool {
    Self::with_extra_roots(Vec::new())
  }

  /// Like [`UpstreamPool::new`], additionally trusting the given root
  /// certificates (private CAs for internal upstreams).
  pub fn with_extra_roots(
    extra: Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>,
  ) -> UpstreamPool {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
      roots.add(cert).ok();
    }
    for cert in extra {
      roots.add(cert).ok();
    }
    let config = ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth();
    UpstreamPool {
      idle: std::sync::Mutex::new(HashMap::new()),
      tls: TlsConnector::from(Arc::new(config)),
    }
  }

  /// Reuse an idle connection for the origin or open a fresh one.
  pub async fn checkout(&self, scheme: &str, host: &str, port: u16) -> Result<UpstreamConn> {
    let key = format!("{}://{}:{}", scheme, host, port);
    {
      let mut idle = self.idle.lock().expect("pool lock");
      if let Some(queue) = idle.get_mut(&key) {
        while let Some(entry) = queue.pop_front() {
          if entry.since.elapsed() < IDLE_MAX_AGE {
            return Ok(entry.conn);
          }
        }
      }
    }
    self.connect(&key, scheme, host, port).await
  }

  /// Return a connection to the pool for reuse.
  pub fn checkin(&self, conn: UpstreamConn) {
    let mut idle = self.idle.lock().expect("pool lock");
    let queue = idle.entry(conn.key.clone()).or_default();
    if queue.len() < MAX_IDLE_PER_HOST {
      queue.push_back(IdleConn {
        conn,
        since: Instant::now(),
      });
    }
  }

  async fn connect(&self, key: &str, scheme: &str, host: &str, port: u16) -> Result<UpstreamConn> {
    let tcp = open_tcp(host, port).await?;
    let stream = if scheme.eq_ignore_ascii_case("https") {
      let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::tls(format!("invalid TLS server name: {}", host)))?;
      let tls = tokio::time::timeout(CONNECT_TIMEOUT, self.tls.connect(server_name, tcp))
        .await
        .map_err(|_| Error::upstream(format!("TLS handshake timeout for {}", host)))?
        .map_err(|e| Error::tls(format!("TLS handshake with {} failed: {}", host, e)))?;
      UpstreamStream::Tls(Box::new(tls))
    } else {
      UpstreamStream::Tcp(tcp)
    };
    Ok(UpstreamConn {
      stream: BufReader::new(stream),
      key: key.to_string(),
    })
  }
}

impl Default for UpstreamPool {
  fn default() -> Self {
    Self::new()
  }
}

/// Resolve and connect, preferring IPv4 addresses.
pub(crate) async fn open_tcp(host: &str, port: u16) -> Result<TcpStream> {
  let addrs = lookup_host((host, port))
    .await
    .map_err(|e| Error::upstream(format!("DNS lookup for {} failed: {}", host, e)))?;
  let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) = addrs.partition(|addr| addr.is_ipv4());
  let mut last_err = None;
  for addr in v4.into_iter().chain(v6) {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
      Ok(Ok(stream)) => {
        stream.set_nodelay(true).ok();
        return Ok(stream);
      }
      Ok(Err(err)) => last_err = Some(err.to_string()),
      Err(_) => last_err = Some(format!("connect to {} timed out", addr)),
    }
  }
  Err(Error::upstream(format!(
    "could not connect to {}:{} ({})",
    host,
    port,
    last_err.unwrap_or_else(|| "no addresses".to_string())
  )))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn checkout_connects_and_checkin_reuses() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      // accept exactly one connection and echo a byte per request
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 1];
      while socket.read_exact(&mut buf).await.is_ok() {
        socket.write_all(&buf).await.unwrap();
      }
    });

    let pool = UpstreamPool::new();
    let mut conn = pool
      .checkout("http", "127.0.0.1", addr.port())
      .await
      .unwrap();
    conn.stream.get_mut().write_all(b"a").await.unwrap();
    let mut byte = [0u8; 1];
    conn.stream.read_exact(&mut byte).await.unwrap();
    assert_eq!(&byte, b"a");

    let key = conn.key().to_string();
    pool.checkin(conn);
    let reused = pool
      .checkout("http", "127.0.0.1", addr.port())
      .await
      .unwrap();
    assert_eq!(reused.key(), key);
  }

  #[tokio::test]
  async fn connect_refused_is_upstream_error() {
    let pool = UpstreamPool::new();
    // bind-then-drop gives a port that refuses connections
    let port = {
      let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap().port()
    };
    let result = pool.checkout("http", "127.0.0.1", port).await;
    assert!(matches!(result, Err(Error::Upstream(_))));
  }
}
