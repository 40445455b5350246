//! Error types for the masquerading proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Invalid or missing startup configuration
  #[error("Configuration error: {0}")]
  Config(String),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// Connection error
  #[error("Connection error: {0}")]
  Connection(String),
}

impl Error {
  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("Configuration error: {}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("Connection error: {}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::error!("IO error: {}", error);
    error
  }
}
