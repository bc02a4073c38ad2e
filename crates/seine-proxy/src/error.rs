//! Error types for the proxy servers
use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that may occur while accepting, relaying or intercepting traffic.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// The client sent something that is not a proxyable request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Failure connecting to or talking to the upstream
  #[error("Upstream error: {0}")]
  Upstream(String),

  /// Upstream did not produce a response head within the deadline
  #[error("Upstream timeout")]
  UpstreamTimeout,

  /// The client went away mid-exchange
  #[error("Client disconnected: {0}")]
  ClientClosed(String),

  /// Capture-core failure surfaced from `seine`
  #[error(transparent)]
  Capture(#[from] seine::Error),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid-request error; logged at debug (client noise)
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a client-disconnect error; never logged above debug
  pub fn client_closed(msg: impl Into<String>) -> Self {
    let error = Error::ClientClosed(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// True for errors caused by the client going away (`EPIPE`-class);
  /// these are silenced rather than reported.
  pub fn is_client_disconnect(&self) -> bool {
    match self {
      Error::ClientClosed(_) => true,
      Error::Io(err) => matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
          | io::ErrorKind::ConnectionReset
          | io::ErrorKind::ConnectionAborted
          | io::ErrorKind::UnexpectedEof
      ),
      _ => false,
    }
  }
}
