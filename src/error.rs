//! Error types shared by the cache, mutation and refresh layers.

use std::time::Duration;
use thiserror::Error;

/// Failure of a fetch, remote write or retry cycle.
///
/// Errors are `Clone` because a single in-flight fetch may be awaited by
/// several readers at once.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  /// The request never produced a response (connection dropped, DNS, ...)
  #[error("Network request failed: {0}")]
  Network(String),

  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  /// Reachability is known to be lost
  #[error("Network is offline")]
  Offline,

  /// The backend answered with a non-success status
  #[error("Backend responded with status {status}: {message}")]
  Status { status: u16, message: String },

  #[error("Failed to decode response: {0}")]
  Decode(String),

  /// Programmer error: an empty or malformed key
  #[error("Invalid cache key: {0:?}")]
  InvalidKey(String),

  /// A pending retry or fetch was cancelled before it ran
  #[error("Operation was cancelled")]
  Cancelled,
}

impl CacheError {
  /// Whether the error is worth retrying with backoff.
  ///
  /// Server errors and rate limiting are transient; any other status means the
  /// request itself was wrong and retrying would give the same answer.
  pub fn is_transient(&self) -> bool {
    match self {
      CacheError::Network(_) | CacheError::Timeout(_) | CacheError::Offline => true,
      CacheError::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
      CacheError::Decode(_) | CacheError::InvalidKey(_) | CacheError::Cancelled => false,
    }
  }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_classification() {
    assert!(CacheError::Network("reset".into()).is_transient());
    assert!(CacheError::Timeout(Duration::from_secs(1)).is_transient());
    assert!(CacheError::Offline.is_transient());
    assert!(CacheError::Status {
      status: 503,
      message: "unavailable".into()
    }
    .is_transient());
    assert!(CacheError::Status {
      status: 429,
      message: "slow down".into()
    }
    .is_transient());
  }

  #[test]
  fn test_programmer_errors_are_not_retried() {
    assert!(!CacheError::InvalidKey(String::new()).is_transient());
    assert!(!CacheError::Decode("bad json".into()).is_transient());
    assert!(!CacheError::Cancelled.is_transient());
    assert!(!CacheError::Status {
      status: 404,
      message: "missing".into()
    }
    .is_transient());
  }
}
