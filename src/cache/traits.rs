//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Trait for logical resource identifiers.
///
/// Implementors must produce a stable key; two values describing the same
/// resource and parameters must map to the same key.
pub trait QueryKey {
  /// Cache key for this resource (e.g. "patients:3fa1...")
  fn cache_key(&self) -> String;

  /// Human-readable description, used in logs and notifications
  fn description(&self) -> String {
    self.cache_key()
  }
}

impl QueryKey for str {
  fn cache_key(&self) -> String {
    self.to_string()
  }
}

impl QueryKey for String {
  fn cache_key(&self) -> String {
    self.clone()
  }
}

/// Observable state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
  /// Never fetched, invalidated, or past its retention window
  Empty,
  /// First fetch in progress, no data to show yet
  Loading,
  /// Data within its freshness window
  Fresh,
  /// Data past its freshness window but still usable
  Stale,
  /// Data available and a background fetch in progress
  Revalidating,
  /// Last fetch failed; any previous data is kept
  Error,
}

impl CacheStatus {
  /// Whether a fetch is in progress
  pub fn is_fetching(self) -> bool {
    matches!(self, CacheStatus::Loading | CacheStatus::Revalidating)
  }
}

/// Per-query options. Unset durations fall back to the adaptive tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
  /// Overrides the freshness window
  pub stale_time: Option<Duration>,
  /// Overrides the retention window
  pub cache_time: Option<Duration>,
  /// Revalidate when the window regains focus
  pub refetch_on_window_focus: bool,
  /// When false, reads never start a fetch
  pub enabled: bool,
  /// Overrides the retry budget
  pub retry: Option<u32>,
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self {
      stale_time: None,
      cache_time: None,
      refetch_on_window_focus: true,
      enabled: true,
      retry: None,
    }
  }
}

impl ReadOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
    self.cache_time = Some(cache_time);
    self
  }

  pub fn with_retry(mut self, retry: u32) -> Self {
    self.retry = Some(retry);
    self
  }

  pub fn refetch_on_window_focus(mut self, enabled: bool) -> Self {
    self.refetch_on_window_focus = enabled;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }
}

/// Result of a cache read, including data and metadata about its state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
  /// Last known value, if any
  pub data: Option<Value>,
  pub status: CacheStatus,
  /// Last failure, when `status` is [`CacheStatus::Error`]
  pub error: Option<CacheError>,
  /// Wall-clock time of the last successful fetch
  pub fetched_at: Option<DateTime<Utc>>,
}

impl ReadResult {
  /// Result for a key the cache knows nothing about.
  pub fn empty() -> Self {
    Self {
      data: None,
      status: CacheStatus::Empty,
      error: None,
      fetched_at: None,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == CacheStatus::Loading
  }

  pub fn is_error(&self) -> bool {
    self.status == CacheStatus::Error
  }

  /// Deserialize the cached data into a typed value.
  pub fn data_as<T: DeserializeOwned>(&self) -> CacheResult<Option<T>> {
    self
      .data
      .as_ref()
      .map(|value| T::deserialize(value).map_err(|e| CacheError::Decode(e.to_string())))
      .transpose()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_default_options() {
    let options = ReadOptions::default();
    assert!(options.enabled);
    assert!(options.refetch_on_window_focus);
    assert_eq!(options.stale_time, None);
  }

  #[test]
  fn test_data_as() {
    let result = ReadResult {
      data: Some(json!([1, 2, 3])),
      status: CacheStatus::Fresh,
      error: None,
      fetched_at: None,
    };
    assert_eq!(result.data_as::<Vec<u32>>().unwrap(), Some(vec![1, 2, 3]));
    assert!(matches!(result.data_as::<String>(), Err(CacheError::Decode(_))));
    assert_eq!(ReadResult::empty().data_as::<Vec<u32>>().unwrap(), None);
  }
}
