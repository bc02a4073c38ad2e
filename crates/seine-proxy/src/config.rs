//! Proxy configuration.

use std::net::IpAddr;
use std::path::PathBuf;

use seine::DEFAULT_BODY_LIMIT;

/// Configuration for both listeners and the capture pipeline.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Address both listeners bind to. Loopback only by default.
  pub bind_addr: IpAddr,
  /// Intercepting proxy port (absolute-form + CONNECT).
  pub proxy_port: u16,
  /// Control/observer API port.
  pub http_port: u16,
  /// Intercept TLS on CONNECT instead of blind tunneling.
  pub mitm: bool,
  /// Directory for the MITM CA material.
  pub ca_dir: PathBuf,
  /// Root directory for session storage.
  pub data_dir: PathBuf,
  /// Cap on captured body text, bytes.
  pub body_limit: usize,
  /// In-memory ring capacity.
  pub ring_capacity: usize,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    Self {
      bind_addr: IpAddr::from([127, 0, 0, 1]),
      proxy_port: 8888,
      http_port: 8787,
      mitm: false,
      ca_dir: cwd.join("certs"),
      data_dir: cwd.join("data").join("sessions"),
      body_limit: DEFAULT_BODY_LIMIT,
      ring_capacity: seine::DEFAULT_RING_CAPACITY,
    }
  }
}

impl ProxyConfig {
  /// Apply environment overrides: `PORT` (control API), `PROXY_PORT` or
  /// `MITM_PORT` (proxy listener), `BODY_LIMIT` (capture cap in bytes).
  pub fn apply_env(mut self) -> Self {
    if let Some(port) = env_parse::<u16>("PORT") {
      self.http_port = port;
    }
    if let Some(port) = env_parse::<u16>("PROXY_PORT").or_else(|| env_parse::<u16>("MITM_PORT")) {
      self.proxy_port = port;
    }
    if let Some(limit) = env_parse::<usize>("BODY_LIMIT") {
      self.body_limit = limit.max(1);
    }
    self
  }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
  std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_loopback_with_spec_ports() {
    let config = ProxyConfig::default();
    assert!(config.bind_addr.is_loopback());
    assert_eq!(config.proxy_port, 8888);
    assert_eq!(config.http_port, 8787);
    assert_eq!(config.body_limit, 64 * 1024);
  }
}
