//! seine binary: the intercepting proxy and its observer API.
//!
//! Run with: cargo run -p seine-proxy

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use seine::{LogRing, SessionStore};
use seine_proxy::api::{self, ApiState};
use seine_proxy::{
  CapturePipeline, CertificateAuthority, ProxyConfig, ProxyContext, ProxyServer,
};

/// In-flight exchanges get this long to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "seine", about = "Local HTTP(S) capture proxy and API catalog builder")]
struct Args {
  /// Intercepting proxy port
  #[arg(long, default_value_t = 8888)]
  proxy_port: u16,

  /// Control/observer API port
  #[arg(long, default_value_t = 8787)]
  http_port: u16,

  /// Terminate TLS on CONNECT with a locally issued certificate
  #[arg(long)]
  mitm: bool,

  /// Session storage root (default: ./data/sessions)
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// CA material directory (default: ./certs)
  #[arg(long)]
  certs_dir: Option<PathBuf>,

  /// In-memory ring capacity
  #[arg(long, default_value_t = seine::DEFAULT_RING_CAPACITY)]
  ring_capacity: usize,

  /// Bind address for both listeners
  #[arg(long)]
  bind: Option<IpAddr>,
}

impl Args {
  fn into_config(self) -> ProxyConfig {
    let mut config = ProxyConfig {
      proxy_port: self.proxy_port,
      http_port: self.http_port,
      mitm: self.mitm,
      ring_capacity: self.ring_capacity,
      ..ProxyConfig::default()
    };
    if let Some(dir) = self.data_dir {
      config.data_dir = dir;
    }
    if let Some(dir) = self.certs_dir {
      config.ca_dir = dir;
    }
    if let Some(addr) = self.bind {
      config.bind_addr = addr;
    }
    config.apply_env()
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("seine=info,seine_proxy=info")),
    )
    .init();

  let config = Args::parse().into_config();

  let store = Arc::new(SessionStore::new(&config.data_dir));
  store.init().await?;
  let ring = LogRing::new(config.ring_capacity);
  let pipeline = CapturePipeline::new(ring.clone(), store.clone());

  let ca = if config.mitm {
    let ca = Arc::new(CertificateAuthority::open(&config.ca_dir).await?);
    info!("MITM enabled; install {} into the client trust store", ca.ca_path().display());
    Some(ca)
  } else {
    None
  };

  let ctx = Arc::new(ProxyContext {
    config: config.clone(),
    pipeline: pipeline.clone(),
    pool: seine_proxy::upstream::UpstreamPool::new(),
    ca: ca.clone(),
    active: AtomicUsize::new(0),
  });

  let proxy_listener = TcpListener::bind((config.bind_addr, config.proxy_port)).await?;
  info!("proxy listening on {}", proxy_listener.local_addr()?);
  let proxy_ctx = ctx.clone();
  let proxy_task = tokio::spawn(async move {
    if let Err(err) = ProxyServer::new(proxy_ctx).run(proxy_listener).await {
      tracing::error!("proxy listener failed: {}", err);
    }
  });

  let api_state = ApiState {
    ring,
    store: store.clone(),
    pipeline: pipeline.clone(),
    ca_pem: ca.map(|ca| ca.ca_pem().to_string()),
  };
  let api_listener = TcpListener::bind((config.bind_addr, config.http_port)).await?;
  info!("observer API on http://{}", api_listener.local_addr()?);
  axum::serve(api_listener, api::build_router(api_state))
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  // stop accepting, close the session, then give exchanges a grace window
  proxy_task.abort();
  if let Some(meta) = pipeline.stop_session().await? {
    info!("closed session {} ({} logs)", meta.id, meta.log_count);
  }
  let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
  while ctx.active_connections() > 0 && tokio::time::Instant::now() < deadline {
    tokio::time::sleep(Duration::from_millis(100)).await;
  }
  if ctx.active_connections() > 0 {
    info!("tearing down {} in-flight connection(s)", ctx.active_connections());
  }
  Ok(())
}

async fn shutdown_signal() {
  tokio::signal::ctrl_c().await.ok();
  info!("shutdown requested");
}
