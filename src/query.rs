//! UI-facing query handle over the shared cache.
//!
//! A `Query` binds a resource key, its fetcher and per-query options to a
//! [`CacheStore`], so a screen only deals with `{data, status, refetch}`.
//!
//! # Example
//!
//! ```ignore
//! let key = ClinicQueryKey::Appointments { date: Some(today), patient_id: None };
//! let mut query = Query::new(store.clone(), &key, http.fetcher("rest/v1/appointments"))
//!   .with_options(ReadOptions::default().with_stale_time(Duration::from_secs(30)));
//!
//! // In render
//! let result = query.read()?;
//! match result.status {
//!   CacheStatus::Loading => render_spinner(),
//!   _ => render_rows(result.data),
//! }
//!
//! // In event loop tick
//! if query.poll() {
//!   // State changed, trigger re-render
//! }
//! ```

use futures::future::FutureExt;
use serde_json::Value;

use crate::cache::{CacheStore, FetchHandle, QueryKey, ReadOptions, ReadResult};
use crate::error::CacheResult;
use crate::fetch::FetchFn;
use crate::refresh::{refresh_fn, RefreshPolicy, RefreshRegistration, SmartRefreshScheduler};

/// Read handle for one cached resource.
pub struct Query {
  store: CacheStore,
  key: String,
  description: String,
  fetcher: FetchFn,
  options: ReadOptions,
  last: Option<ReadResult>,
}

impl Query {
  pub fn new<K>(store: CacheStore, key: &K, fetcher: FetchFn) -> Self
  where
    K: QueryKey + ?Sized,
  {
    Self {
      store,
      key: key.cache_key(),
      description: key.description(),
      fetcher,
      options: ReadOptions::default(),
      last: None,
    }
  }

  pub fn with_options(mut self, options: ReadOptions) -> Self {
    self.options = options;
    self
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn options(&self) -> &ReadOptions {
    &self.options
  }

  /// Read through the cache, starting a fetch when the data needs one.
  pub fn read(&self) -> CacheResult<ReadResult> {
    self.store.read(&self.key, &self.fetcher, &self.options)
  }

  /// Current state without side effects.
  pub fn state(&self) -> ReadResult {
    self.store.peek(&self.key, &self.options)
  }

  /// Fetch regardless of freshness; the handle may be awaited or dropped.
  pub fn refetch(&self) -> CacheResult<FetchHandle> {
    self.store.refetch(&self.key, &self.fetcher, &self.options)
  }

  /// Wait for data, using the cache when it is fresh.
  pub async fn fetch(&self) -> CacheResult<Value> {
    self.store.fetch(&self.key, &self.fetcher, &self.options).await
  }

  pub fn prefetch(&self) -> CacheResult<bool> {
    self.store.prefetch(&self.key, &self.fetcher, &self.options)
  }

  pub fn invalidate(&self) {
    self.store.invalidate(&self.key);
  }

  /// Check whether the cached state changed since the last poll.
  ///
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let current = self.state();
    let changed = self.last.as_ref() != Some(&current);
    self.last = Some(current);
    changed
  }

  /// Refetch this query on lifecycle signals for as long as the returned
  /// registration is held.
  ///
  /// Focus refetches follow `refetch_on_window_focus`; disabled queries are
  /// never refreshed. A signal arriving while a fetch is in flight attaches
  /// to it, and fresh data is left alone.
  pub fn watch_lifecycle(&self, scheduler: &SmartRefreshScheduler) -> RefreshRegistration {
    let enabled = self.options.enabled;
    let mut policy = RefreshPolicy::default()
      .on_focus(enabled && self.options.refetch_on_window_focus)
      .on_reconnect(enabled)
      .on_visible(enabled);
    policy.max_age = self.options.stale_time;

    let store = self.store.clone();
    let key = self.key.clone();
    let fetcher = self.fetcher.clone();
    let options = self.options;
    let refresh = refresh_fn(move || {
      let handle = store.revalidate(&key, &fetcher, &options);
      async move { handle?.map(|result| result.map(|_| ())).await }
    });
    scheduler.register(self.key.clone(), refresh, policy)
  }
}

impl std::fmt::Debug for Query {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
