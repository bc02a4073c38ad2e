//! The intercepting proxy listener.
//!
//! One accept loop serves three shapes of traffic on the same port:
//! absolute-form (and origin-form) plain HTTP requests, opaque CONNECT
//! tunnels, and — when MITM is enabled — TLS terminated on a locally
//! issued leaf certificate with the decrypted exchanges re-entering the
//! plain forwarding path under the `https` scheme.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::ca::CertificateAuthority;
use crate::codec;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::forward::{self, Persistence};
use crate::pipeline::CapturePipeline;
use crate::tunnel;
use crate::upstream::UpstreamPool;

/// Shared state of the proxy data plane.
pub struct ProxyContext {
  pub config: ProxyConfig,
  pub pipeline: CapturePipeline,
  pub pool: UpstreamPool,
  /// Present when MITM interception is enabled.
  pub ca: Option<Arc<CertificateAuthority>>,
  /// In-flight connection count, used by the shutdown grace window.
  pub active: std::sync::atomic::AtomicUsize,
}

impl ProxyContext {
  pub fn active_connections(&self) -> usize {
    self.active.load(std::sync::atomic::Ordering::Relaxed)
  }
}

/// The proxy accept loop.
pub struct ProxyServer {
  ctx: Arc<ProxyContext>,
}

impl ProxyServer {
  pub fn new(ctx: Arc<ProxyContext>) -> ProxyServer {
    ProxyServer { ctx }
  }

  /// Serve connections off a pre-bound listener until cancelled.
  pub async fn run(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          stream.set_nodelay(true).ok();
          let ctx = self.ctx.clone();
          ctx.active.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
          tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, ctx.clone()).await {
              if err.is_client_disconnect() {
                tracing::debug!("connection from {} closed: {}", peer, err);
              } else {
                tracing::warn!("connection from {} failed: {}", peer, err);
              }
            }
            ctx.active.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
          });
        }
        Err(err) => {
          tracing::error!("accept failed: {}", err);
        }
      }
    }
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer: SocketAddr,
  ctx: Arc<ProxyContext>,
) -> Result<()> {
  let mut client = BufReader::new(stream);
  loop {
    let head = match codec::read_request_head(&mut client).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(err) => {
        tracing::debug!("bad request head from {}: {}", peer, err);
        forward::respond_bad_request(&mut client).await.ok();
        return Ok(());
      }
    };

    if head.method == http::Method::CONNECT {
      let (host, port) = tunnel::parse_connect_target(&head.target)?;
      // bytes buffered past the CONNECT head belong to the tunneled stream
      let leftover = client.buffer().to_vec();
      let stream = client.into_inner();
      return dispatch_connect(stream, leftover, host, port, ctx).await;
    }

    match forward::handle_exchange(&mut client, head, "http", None, &ctx).await {
      Ok(Persistence::KeepAlive) => continue,
      Ok(Persistence::Close) => return Ok(()),
      Err(err) => return Err(err),
    }
  }
}

async fn dispatch_connect(
  stream: TcpStream,
  leftover: Vec<u8>,
  host: String,
  port: u16,
  ctx: Arc<ProxyContext>,
) -> Result<()> {
  match ctx.ca.clone() {
    Some(ca) if ctx.config.mitm => intercept_tls(stream, leftover, &host, port, ca, ctx).await,
    _ => tunnel::tunnel(stream, leftover, &host, port, &ctx).await,
  }
}

/// Terminate the client's TLS on a leaf for `host` and serve the decrypted
/// exchanges through the plain forwarding path with `scheme = https`.
///
/// A client that does not trust the CA fails the handshake; that tears the
/// transport down quietly and emits nothing.
async fn intercept_tls(
  mut stream: TcpStream,
  leftover: Vec<u8>,
  host: &str,
  port: u16,
  ca: Arc<CertificateAuthority>,
  ctx: Arc<ProxyContext>,
) -> Result<()> {
  stream.write_all(tunnel::ESTABLISHED).await?;
  stream.flush().await?;

  let config = ca.server_config(host).await?;
  let acceptor = TlsAcceptor::from(config);
  let tls = match acceptor.accept(Prefixed::new(leftover, stream)).await {
    Ok(tls) => tls,
    Err(err) => {
      tracing::debug!("TLS handshake with client failed for {}: {}", host, err);
      return Ok(());
    }
  };

  let authority = if port == 443 {
    host.to_string()
  } else {
    format!("{}:{}", host, port)
  };
  let mut client = BufReader::new(tls);
  loop {
    let head = match codec::read_request_head(&mut client).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(err) => {
        tracing::debug!("bad decrypted head for {}: {}", authority, err);
        forward::respond_bad_request(&mut client).await.ok();
        return Ok(());
      }
    };
    match forward::handle_exchange(&mut client, head, "https", Some(&authority), &ctx).await {
      Ok(Persistence::KeepAlive) => continue,
      Ok(Persistence::Close) => return Ok(()),
      Err(err) if err.is_client_disconnect() => return Ok(()),
      Err(err) => return Err(err),
    }
  }
}

/// A stream that replays already-buffered bytes before reading from the
/// inner transport. Needed when a client pipelines its TLS ClientHello
/// behind the CONNECT head.
struct Prefixed<S> {
  prefix: Vec<u8>,
  pos: usize,
  inner: S,
}

impl<S> Prefixed<S> {
  fn new(prefix: Vec<u8>, inner: S) -> Prefixed<S> {
    Prefixed {
      prefix,
      pos: 0,
      inner,
    }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if self.pos < self.prefix.len() {
      let n = (self.prefix.len() - self.pos).min(buf.remaining());
      let pos = self.pos;
      buf.put_slice(&self.prefix[pos..pos + n]);
      self.pos += n;
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
