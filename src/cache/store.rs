//! Cache store that orchestrates freshness, deduplication and revalidation.

use futures::future::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::entry::{CacheEntry, Confirmation, FetchHandle, InFlight, Updater, Windows};
use super::traits::{CacheStatus, ReadOptions, ReadResult};
use crate::error::{CacheError, CacheResult};
use crate::fetch::FetchFn;
use crate::network::{AdaptiveConfig, AdaptiveConfigProvider};
use crate::notify::Notifier;
use crate::retry::{ErrorRecoveryExecutor, DEFAULT_MAX_DELAY};

/// Identifies one optimistic write on the store's undo stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteId(u64);

/// Store-wide settings that do not depend on connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
  /// Upper bound for a single fetch attempt
  pub request_timeout: Duration,
  /// First backoff delay; doubled on each retry
  pub retry_base_delay: Duration,
  /// Ceiling for a single backoff delay
  pub max_retry_delay: Duration,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      request_timeout: Duration::from_secs(30),
      retry_base_delay: Duration::from_secs(1),
      max_retry_delay: DEFAULT_MAX_DELAY,
    }
  }
}

struct StoreInner {
  entries: Mutex<HashMap<String, CacheEntry>>,
  adaptive: AdaptiveConfigProvider,
  settings: CacheSettings,
  notifier: Mutex<Option<Arc<dyn Notifier>>>,
  write_ids: AtomicU64,
}

impl StoreInner {
  // Entry updates never panic halfway, so a poisoned map is still consistent
  fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn windows(&self, adaptive: &AdaptiveConfig, options: &ReadOptions) -> Windows {
    Windows {
      freshness: options.stale_time.unwrap_or(adaptive.freshness_window),
      retention: options.cache_time.unwrap_or(adaptive.retention_window),
    }
  }

  fn complete_fetch(&self, key: &str, seq: u64, result: &CacheResult<Value>) {
    let now = Instant::now();
    let failure = {
      let mut entries = self.lock();
      let Some(entry) = entries.get_mut(key) else {
        return;
      };

      if entry.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
        entry.in_flight = None;
      }

      match result {
        Ok(value) => {
          if entry.accept_fetch(seq, value.clone(), now) {
            debug!(key, seq, "fetch result accepted");
          } else {
            debug!(key, seq, accepted = entry.accepted_seq, "discarding superseded fetch result");
          }
          None
        }
        // A newer fetch or write owns the entry now
        Err(_) if seq <= entry.accepted_seq || entry.in_flight.is_some() => None,
        Err(error) => {
          warn!(key, %error, "fetch failed");
          entry.record_failure(error.clone(), now);
          Some(error.clone())
        }
      }
    };

    let Some(error) = failure else {
      return;
    };
    let notifier = self
      .notifier
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    if let Some(notifier) = notifier {
      notifier.error(&format!("Could not load {}: {}", key, error));
    }
  }
}

/// Per-key cache of backend responses.
///
/// Created once per application session and shared by cloning; all clones
/// see the same entries. Reads are synchronous and never wait on the network:
/// fetches run as spawned tasks, so a tokio runtime must be running.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl CacheStore {
  pub fn new(adaptive: AdaptiveConfigProvider) -> Self {
    Self::with_settings(adaptive, CacheSettings::default())
  }

  pub fn with_settings(adaptive: AdaptiveConfigProvider, settings: CacheSettings) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        entries: Mutex::new(HashMap::new()),
        adaptive,
        settings,
        notifier: Mutex::new(None),
        write_ids: AtomicU64::new(0),
      }),
    }
  }

  /// Report terminal read failures to `notifier`.
  pub fn with_notifier(self, notifier: Arc<dyn Notifier>) -> Self {
    self.set_notifier(notifier);
    self
  }

  /// Replace the notifier for this store and every clone of it.
  pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
    *self
      .inner
      .notifier
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(notifier);
  }

  pub fn adaptive(&self) -> &AdaptiveConfigProvider {
    &self.inner.adaptive
  }

  /// Read `key`, starting or scheduling a fetch as its freshness requires.
  ///
  /// - empty or past retention: starts a fetch, returns `Loading`
  /// - fresh: returns the data, no side effect
  /// - stale: returns the data as `Stale` and revalidates in the background
  /// - fetching: attaches to the in-flight fetch
  /// - error: returns the retained data; retried once the freshness window
  ///   since the failure has passed
  pub fn read(&self, key: &str, fetcher: &FetchFn, options: &ReadOptions) -> CacheResult<ReadResult> {
    validate_key(key)?;
    let adaptive = self.inner.adaptive.current();
    let windows = self.inner.windows(&adaptive, options);
    let now = Instant::now();

    let mut entries = self.inner.lock();
    let entry = entries.entry(key.to_string()).or_default();
    entry.retention = Some(windows.retention);

    if entry.is_expired(now, windows.retention) {
      debug!(key, "entry past retention window");
      entry.clear();
    }

    let status = entry.status(now, windows);
    let should_fetch = options.enabled
      && match status {
        CacheStatus::Empty | CacheStatus::Stale => true,
        CacheStatus::Error => entry.error_retry_due(now, windows.freshness),
        CacheStatus::Fresh | CacheStatus::Loading | CacheStatus::Revalidating => false,
      };

    if !should_fetch {
      trace!(key, ?status, "cache read");
      return Ok(entry.snapshot(status));
    }

    let budget = options.retry.unwrap_or(adaptive.retry_budget);
    self.start_fetch(key, entry, fetcher.clone(), budget);

    // Stale and error reads report the state the caller is looking at
    let reported = match status {
      CacheStatus::Empty => CacheStatus::Loading,
      other => other,
    };
    debug!(key, ?status, "cache read started fetch");
    Ok(entry.snapshot(reported))
  }

  /// Current state of `key` without starting any fetch.
  pub fn peek(&self, key: &str, options: &ReadOptions) -> ReadResult {
    let windows = self.inner.windows(&self.inner.adaptive.current(), options);
    let now = Instant::now();
    let entries = self.inner.lock();
    match entries.get(key) {
      Some(entry) if entry.is_expired(now, windows.retention) => ReadResult::empty(),
      Some(entry) => entry.snapshot(entry.status(now, windows)),
      None => ReadResult::empty(),
    }
  }

  /// Fetch `key` and wait for the result.
  ///
  /// Fresh data is returned directly; otherwise the call attaches to the
  /// in-flight fetch or starts one.
  pub async fn fetch(
    &self,
    key: &str,
    fetcher: &FetchFn,
    options: &ReadOptions,
  ) -> CacheResult<Value> {
    self.revalidate(key, fetcher, options)?.await
  }

  /// Bring `key` up to date without ever running two fetches for it.
  ///
  /// Attaches to the in-flight fetch if there is one, resolves immediately
  /// with fresh data, and starts a fetch otherwise. Background refreshes go
  /// through here; [`refetch`](Self::refetch) is for explicit user requests.
  pub fn revalidate(
    &self,
    key: &str,
    fetcher: &FetchFn,
    options: &ReadOptions,
  ) -> CacheResult<FetchHandle> {
    validate_key(key)?;
    let adaptive = self.inner.adaptive.current();
    let windows = self.inner.windows(&adaptive, options);
    let now = Instant::now();

    let mut entries = self.inner.lock();
    let entry = entries.entry(key.to_string()).or_default();
    entry.retention = Some(windows.retention);
    if entry.is_expired(now, windows.retention) {
      entry.clear();
    }

    if let Some(in_flight) = &entry.in_flight {
      trace!(key, seq = in_flight.seq, "attached to in-flight fetch");
      return Ok(in_flight.handle.clone());
    }
    if entry.status(now, windows) == CacheStatus::Fresh {
      if let Some(data) = entry.data.clone() {
        trace!(key, "fresh, no fetch needed");
        return Ok(async move { Ok(data) }.boxed().shared());
      }
    }
    let budget = options.retry.unwrap_or(adaptive.retry_budget);
    Ok(self.start_fetch(key, entry, fetcher.clone(), budget))
  }

  /// Start a new fetch for `key` even if one is in flight.
  ///
  /// The older fetch keeps running, but its result is discarded if it lands
  /// after this one. The returned handle may be awaited or dropped.
  pub fn refetch(
    &self,
    key: &str,
    fetcher: &FetchFn,
    options: &ReadOptions,
  ) -> CacheResult<FetchHandle> {
    validate_key(key)?;
    let adaptive = self.inner.adaptive.current();
    let budget = options.retry.unwrap_or(adaptive.retry_budget);
    let mut entries = self.inner.lock();
    let entry = entries.entry(key.to_string()).or_default();
    entry.retention = Some(self.inner.windows(&adaptive, options).retention);
    Ok(self.start_fetch(key, entry, fetcher.clone(), budget))
  }

  /// Warm `key` ahead of use when the connection allows speculative fetching.
  ///
  /// Returns whether a fetch was started.
  pub fn prefetch(&self, key: &str, fetcher: &FetchFn, options: &ReadOptions) -> CacheResult<bool> {
    validate_key(key)?;
    let adaptive = self.inner.adaptive.current();
    if !adaptive.preloading_enabled {
      trace!(key, "prefetch skipped on constrained connection");
      return Ok(false);
    }

    let windows = self.inner.windows(&adaptive, options);
    let now = Instant::now();
    let mut entries = self.inner.lock();
    let entry = entries.entry(key.to_string()).or_default();
    entry.retention = Some(windows.retention);
    if entry.is_expired(now, windows.retention) {
      entry.clear();
    }
    match entry.status(now, windows) {
      CacheStatus::Empty | CacheStatus::Stale => {
        let budget = options.retry.unwrap_or(adaptive.retry_budget);
        self.start_fetch(key, entry, fetcher.clone(), budget);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  /// Wait for the fetch currently in flight for `key`, if any.
  pub async fn settle(&self, key: &str) -> Option<CacheResult<Value>> {
    let handle = {
      let entries = self.inner.lock();
      entries.get(key)?.in_flight.as_ref()?.handle.clone()
    };
    Some(handle.await)
  }

  /// Force the next read of `key` to treat it as empty.
  ///
  /// Any in-flight fetch is detached and its result will be discarded.
  /// Pending optimistic writes stay on the undo stack and are re-applied to
  /// the next fetched value.
  pub fn invalidate(&self, key: &str) {
    let mut entries = self.inner.lock();
    if let Some(entry) = entries.get_mut(key) {
      entry.clear();
      entry.in_flight = None;
      entry.accepted_seq = entry.next_seq();
      debug!(key, "invalidated");
    }
  }

  /// Invalidate every key starting with `prefix`. Returns the number of keys.
  pub fn invalidate_matching(&self, prefix: &str) -> usize {
    let keys: Vec<String> = {
      let entries = self.inner.lock();
      entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect()
    };
    for key in &keys {
      self.invalidate(key);
    }
    keys.len()
  }

  /// Cancel the in-flight fetch for `key`, including any scheduled retry.
  ///
  /// Waiters on the cancelled fetch receive [`CacheError::Cancelled`].
  pub fn cancel(&self, key: &str) -> bool {
    let mut entries = self.inner.lock();
    let Some(in_flight) = entries.get_mut(key).and_then(|e| e.in_flight.take()) else {
      return false;
    };
    in_flight.retry.cancel();
    in_flight.abort.abort();
    debug!(key, seq = in_flight.seq, "fetch cancelled");
    true
  }

  /// Apply `updater` to the cached data without contacting the network.
  ///
  /// The change is not tracked for rollback, but it is preserved when an
  /// earlier tracked write rolls back.
  pub fn update_optimistic<F>(&self, key: &str, updater: F) -> CacheResult<()>
  where
    F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
  {
    let id = self.begin_write(key, Arc::new(updater))?;
    self.confirm_write(key, id, Confirmation::Keep);
    Ok(())
  }

  /// Push an optimistic write onto the undo stack for `key` and apply it.
  pub fn begin_write(&self, key: &str, updater: Updater) -> CacheResult<WriteId> {
    validate_key(key)?;
    let id = self.inner.write_ids.fetch_add(1, Ordering::Relaxed) + 1;
    let mut entries = self.inner.lock();
    let entry = entries.entry(key.to_string()).or_default();
    entry.apply_write(id, updater, Instant::now());
    trace!(key, write = id, pending = entry.pending.len(), "optimistic write applied");
    Ok(WriteId(id))
  }

  /// Confirm a write, reconciling the cached data with the server's answer.
  pub fn confirm_write(&self, key: &str, id: WriteId, confirmation: Confirmation) -> bool {
    let mut entries = self.inner.lock();
    entries
      .get_mut(key)
      .is_some_and(|entry| entry.settle_write(id.0, confirmation))
  }

  /// Roll back a write to the state immediately preceding it.
  pub fn rollback_write(&self, key: &str, id: WriteId) -> bool {
    let mut entries = self.inner.lock();
    let rolled_back = entries
      .get_mut(key)
      .is_some_and(|entry| entry.rollback_write(id.0));
    if rolled_back {
      info!(key, write = id.0, "optimistic write rolled back");
    }
    rolled_back
  }

  /// Number of optimistic writes still tracked for `key`
  pub fn pending_writes(&self, key: &str) -> usize {
    let entries = self.inner.lock();
    entries.get(key).map_or(0, |e| e.pending.len())
  }

  /// Whether the fetch for `key` is waiting to retry
  pub fn is_retrying(&self, key: &str) -> bool {
    let entries = self.inner.lock();
    entries
      .get(key)
      .and_then(|e| e.in_flight.as_ref())
      .is_some_and(|f| f.retry.is_retrying())
  }

  pub fn retry_count(&self, key: &str) -> u32 {
    let entries = self.inner.lock();
    entries
      .get(key)
      .and_then(|e| e.in_flight.as_ref())
      .map_or(0, |f| f.retry.retry_count())
  }

  pub fn keys(&self) -> Vec<String> {
    self.inner.lock().keys().cloned().collect()
  }

  /// Drop idle entries that are empty or untouched for longer than their
  /// retention window. Returns the number removed.
  ///
  /// Each entry keeps the retention (`cache_time`) of its latest read; entries
  /// never read fall back to the current adaptive window.
  pub fn collect_garbage(&self) -> usize {
    let default_retention = self.inner.adaptive.current().retention_window;
    let now = Instant::now();
    let mut entries = self.inner.lock();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_collectable(now, default_retention));
    let removed = before - entries.len();
    if removed > 0 {
      debug!(removed, "cache entries collected");
    }
    removed
  }

  /// Spawn a fetch for `key` and register it as the entry's in-flight fetch.
  ///
  /// Called with the map locked; the spawned task only touches the map once
  /// the fetch has resolved.
  fn start_fetch(
    &self,
    key: &str,
    entry: &mut CacheEntry,
    fetcher: FetchFn,
    retry_budget: u32,
  ) -> FetchHandle {
    let seq = entry.next_seq();
    let retry = ErrorRecoveryExecutor::new().with_max_delay(self.inner.settings.max_retry_delay);
    let task = tokio::spawn(run_fetch(
      Arc::clone(&self.inner),
      key.to_string(),
      seq,
      fetcher,
      retry_budget,
      retry.clone(),
    ));
    let abort = task.abort_handle();
    let handle = async move { task.await.unwrap_or(Err(CacheError::Cancelled)) }
      .boxed()
      .shared();

    debug!(key, seq, retry_budget, "fetch started");
    entry.in_flight = Some(InFlight {
      seq,
      handle: handle.clone(),
      abort,
      retry,
    });
    handle
  }
}

async fn run_fetch(
  inner: Arc<StoreInner>,
  key: String,
  seq: u64,
  fetcher: FetchFn,
  retry_budget: u32,
  retry: ErrorRecoveryExecutor,
) -> CacheResult<Value> {
  let timeout = inner.settings.request_timeout;
  let result = retry
    .execute_with_retry(
      || {
        let attempt = fetcher();
        async move {
          match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
          }
        }
      },
      retry_budget,
      inner.settings.retry_base_delay,
    )
    .await;

  inner.complete_fetch(&key, seq, &result);
  result
}

fn validate_key(key: &str) -> CacheResult<()> {
  if key.trim().is_empty() {
    return Err(CacheError::InvalidKey(key.to_string()));
  }
  Ok(())
}
