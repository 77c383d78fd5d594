//! Lifecycle-driven background refresh.
//!
//! Screens register a refresh callback per key. When the app regains focus,
//! reconnects, or becomes visible, every registration whose data is older than
//! its max age is refreshed, at most once at a time per key.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::CacheResult;
use crate::event::{LifecycleBus, LifecycleEvent};
use crate::network::AdaptiveConfigProvider;

/// Callback invoked to refresh one key
pub type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, CacheResult<()>> + Send + Sync>;

/// Box a closure into a [`RefreshFn`]
pub fn refresh_fn<F, Fut>(f: F) -> RefreshFn
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = CacheResult<()>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}

/// Which lifecycle signals refresh a key, and how old its data may get
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
  /// Defaults to the adaptive freshness window when unset
  pub max_age: Option<Duration>,
  pub on_focus: bool,
  pub on_reconnect: bool,
  pub on_visible: bool,
}

impl Default for RefreshPolicy {
  fn default() -> Self {
    Self {
      max_age: None,
      on_focus: true,
      on_reconnect: true,
      on_visible: true,
    }
  }
}

impl RefreshPolicy {
  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = Some(max_age);
    self
  }

  pub fn on_focus(mut self, enabled: bool) -> Self {
    self.on_focus = enabled;
    self
  }

  pub fn on_reconnect(mut self, enabled: bool) -> Self {
    self.on_reconnect = enabled;
    self
  }

  pub fn on_visible(mut self, enabled: bool) -> Self {
    self.on_visible = enabled;
    self
  }

  fn accepts(&self, event: LifecycleEvent) -> bool {
    match event {
      LifecycleEvent::FocusGained => self.on_focus,
      LifecycleEvent::Reconnected => self.on_reconnect,
      LifecycleEvent::BecameVisible => self.on_visible,
    }
  }
}

struct Registration {
  id: u64,
  refresh: RefreshFn,
  policy: RefreshPolicy,
  last_refresh: Option<Instant>,
  refreshing: bool,
}

impl Registration {
  fn is_due(&self, now: Instant, default_max_age: Duration) -> bool {
    let max_age = self.policy.max_age.unwrap_or(default_max_age);
    self
      .last_refresh
      .map_or(true, |at| now.duration_since(at) > max_age)
  }
}

struct SchedulerInner {
  adaptive: AdaptiveConfigProvider,
  registrations: Mutex<HashMap<String, Registration>>,
  next_id: AtomicU64,
}

impl SchedulerInner {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
    self.registrations.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Mark `key` as refreshing if it is registered and idle
  fn claim(self: &Arc<Self>, key: &str) -> Option<(RefreshClaim, RefreshFn)> {
    let mut registrations = self.lock();
    let registration = registrations.get_mut(key)?;
    if registration.refreshing {
      trace!(key, "refresh already in flight");
      return None;
    }
    registration.refreshing = true;
    let claim = RefreshClaim {
      inner: Arc::clone(self),
      key: key.to_string(),
      id: registration.id,
    };
    Some((claim, Arc::clone(&registration.refresh)))
  }
}

/// Holds a key's `refreshing` flag; released on drop, so a cancelled
/// refresh leaves the key idle.
struct RefreshClaim {
  inner: Arc<SchedulerInner>,
  key: String,
  id: u64,
}

impl RefreshClaim {
  async fn run(self, refresh: RefreshFn) -> CacheResult<()> {
    let result = refresh().await;

    if result.is_ok() {
      let mut registrations = self.inner.lock();
      // The key may have been re-registered while the refresh ran
      if let Some(registration) = registrations.get_mut(&self.key).filter(|r| r.id == self.id) {
        registration.last_refresh = Some(Instant::now());
      }
    }
    match &result {
      Ok(()) => debug!(key = %self.key, "refreshed"),
      Err(error) => warn!(key = %self.key, %error, "refresh failed"),
    }
    result
  }
}

impl Drop for RefreshClaim {
  fn drop(&mut self) {
    let mut registrations = self.inner.lock();
    if let Some(registration) = registrations.get_mut(&self.key).filter(|r| r.id == self.id) {
      registration.refreshing = false;
    }
  }
}

/// Schedules conditional refreshes on lifecycle signals.
///
/// Holds no data of its own; refresh callbacks usually call back into
/// [`CacheStore::revalidate`](crate::cache::CacheStore::revalidate).
#[derive(Clone)]
pub struct SmartRefreshScheduler {
  inner: Arc<SchedulerInner>,
}

impl SmartRefreshScheduler {
  pub fn new(adaptive: AdaptiveConfigProvider) -> Self {
    Self {
      inner: Arc::new(SchedulerInner {
        adaptive,
        registrations: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(0),
      }),
    }
  }

  /// Register `refresh` for `key`, replacing any earlier registration.
  ///
  /// The key stays registered until the returned guard is dropped.
  #[must_use = "dropping the registration unregisters the key"]
  pub fn register(
    &self,
    key: impl Into<String>,
    refresh: RefreshFn,
    policy: RefreshPolicy,
  ) -> RefreshRegistration {
    let key = key.into();
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    self.inner.lock().insert(
      key.clone(),
      Registration {
        id,
        refresh,
        policy,
        last_refresh: None,
        refreshing: false,
      },
    );
    debug!(%key, ?policy, "refresh registered");
    RefreshRegistration {
      key,
      id,
      scheduler: Arc::downgrade(&self.inner),
    }
  }

  /// Refresh every registration that accepts `event` and is due.
  ///
  /// Refreshes run as spawned tasks. Returns the keys that were started.
  pub fn handle_event(&self, event: LifecycleEvent) -> Vec<String> {
    let default_max_age = self.inner.adaptive.current().freshness_window;
    let now = Instant::now();

    let due: Vec<(RefreshClaim, RefreshFn)> = {
      let mut registrations = self.inner.lock();
      registrations
        .iter_mut()
        .filter(|(_, r)| r.policy.accepts(event) && !r.refreshing && r.is_due(now, default_max_age))
        .map(|(key, r)| {
          r.refreshing = true;
          let claim = RefreshClaim {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id: r.id,
          };
          (claim, Arc::clone(&r.refresh))
        })
        .collect()
    };

    debug!(?event, refreshing = due.len(), "lifecycle event");
    due
      .into_iter()
      .map(|(claim, refresh)| {
        let key = claim.key.clone();
        tokio::spawn(async move {
          // Failures are logged by `run`
          let _ = claim.run(refresh).await;
        });
        key
      })
      .collect()
  }

  /// Refresh `key` now regardless of its age.
  ///
  /// Returns `None` if the key is not registered or already refreshing.
  pub async fn force_refresh(&self, key: &str) -> Option<CacheResult<()>> {
    {
      let mut registrations = self.inner.lock();
      registrations.get_mut(key)?.last_refresh = None;
    }
    let (claim, refresh) = self.inner.claim(key)?;
    Some(claim.run(refresh).await)
  }

  pub fn last_refresh_time(&self, key: &str) -> Option<Instant> {
    self.inner.lock().get(key).and_then(|r| r.last_refresh)
  }

  pub fn is_refreshing(&self, key: &str) -> bool {
    self.inner.lock().get(key).is_some_and(|r| r.refreshing)
  }

  pub fn is_registered(&self, key: &str) -> bool {
    self.inner.lock().contains_key(key)
  }

  /// Feed events from `bus` into [`handle_event`](Self::handle_event) until
  /// the returned handle is dropped.
  #[must_use = "dropping the handle stops the listener"]
  pub fn spawn_listener(&self, bus: &LifecycleBus) -> ListenerHandle {
    let mut events = bus.subscribe();
    let scheduler = self.clone();
    let task = tokio::spawn(async move {
      while let Some(event) = events.next().await {
        scheduler.handle_event(event);
      }
      debug!("lifecycle bus closed");
    });
    ListenerHandle { task }
  }
}

/// Keeps a key registered with the scheduler
pub struct RefreshRegistration {
  key: String,
  id: u64,
  scheduler: Weak<SchedulerInner>,
}

impl RefreshRegistration {
  pub fn key(&self) -> &str {
    &self.key
  }
}

impl Drop for RefreshRegistration {
  fn drop(&mut self) {
    let Some(inner) = self.scheduler.upgrade() else {
      return;
    };
    let mut registrations = inner.lock();
    if registrations.get(&self.key).is_some_and(|r| r.id == self.id) {
      registrations.remove(&self.key);
      debug!(key = %self.key, "refresh unregistered");
    }
  }
}

/// Aborts the lifecycle listener task when dropped
pub struct ListenerHandle {
  task: JoinHandle<()>,
}

impl Drop for ListenerHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}
