//! capture engine errors
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `seine::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while capturing or aggregating traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// JSON encode/decode error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  /// the given string is not an absolute URL
  #[error("invalid url: {0}")]
  InvalidUrl(String),
  /// an operation that needs an active session ran without one
  #[error("no active session")]
  NoSession,
  /// unknown session id
  #[error("session not found: {0}")]
  SessionNotFound(String),
  /// the session is the current one and cannot be removed
  #[error("session is active: {0}")]
  SessionActive(String),
  /// Unknown error
  #[error("{0}")]
  Other(String),
}
