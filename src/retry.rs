//! Bounded exponential-backoff retry for fetches and remote writes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

/// Default ceiling for a single backoff delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
  let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
  base.checked_mul(factor).unwrap_or(max).min(max)
}

struct RetryState {
  retrying: AtomicBool,
  retry_count: AtomicU32,
  cancel: Notify,
}

/// Retry wrapper with observable progress.
///
/// Clones share state, so a UI can hold one clone to show "retrying (2)..."
/// while another clone drives the operation, and cancel it from either side.
#[derive(Clone)]
pub struct ErrorRecoveryExecutor {
  state: Arc<RetryState>,
  max_delay: Duration,
}

impl ErrorRecoveryExecutor {
  pub fn new() -> Self {
    Self {
      state: Arc::new(RetryState {
        retrying: AtomicBool::new(false),
        retry_count: AtomicU32::new(0),
        cancel: Notify::new(),
      }),
      max_delay: DEFAULT_MAX_DELAY,
    }
  }

  /// Cap the delay of any single retry.
  pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
    self.max_delay = max_delay;
    self
  }

  /// Whether a retry is currently scheduled or running
  pub fn is_retrying(&self) -> bool {
    self.state.retrying.load(Ordering::SeqCst)
  }

  /// Number of retries performed in the current cycle
  pub fn retry_count(&self) -> u32 {
    self.state.retry_count.load(Ordering::SeqCst)
  }

  /// Drop any pending scheduled retry without invoking it.
  ///
  /// The waiting `execute_with_retry` call resolves with
  /// [`CacheError::Cancelled`]. An attempt already running is not interrupted.
  pub fn cancel(&self) {
    self.state.cancel.notify_waiters();
  }

  /// Run `operation`, retrying transient failures up to `max_retries` times.
  ///
  /// Non-transient errors are returned immediately. After the last failed
  /// attempt the final error is returned and the counters reset.
  pub async fn execute_with_retry<T, F, Fut>(
    &self,
    mut operation: F,
    max_retries: u32,
    base_delay: Duration,
  ) -> CacheResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = CacheResult<T>>,
  {
    let mut attempt = 0u32;

    loop {
      let error = match operation().await {
        Ok(value) => {
          self.reset();
          return Ok(value);
        }
        Err(e) => e,
      };

      if !error.is_transient() || attempt >= max_retries {
        if attempt > 0 {
          warn!(attempts = attempt + 1, %error, "giving up after retries");
        }
        self.reset();
        return Err(error);
      }

      let delay = backoff_delay(base_delay, attempt, self.max_delay);
      attempt += 1;
      self.state.retrying.store(true, Ordering::SeqCst);
      self.state.retry_count.store(attempt, Ordering::SeqCst);
      debug!(attempt, ?delay, %error, "scheduling retry");

      // Registered before sleeping so a cancel issued during the delay is seen
      let cancelled = self.state.cancel.notified();
      tokio::pin!(cancelled);

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = &mut cancelled => {
          debug!(attempt, "retry cancelled");
          self.reset();
          return Err(CacheError::Cancelled);
        }
      }
    }
  }

  fn reset(&self) {
    self.state.retrying.store(false, Ordering::SeqCst);
    self.state.retry_count.store(0, Ordering::SeqCst);
  }
}

impl Default for ErrorRecoveryExecutor {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for ErrorRecoveryExecutor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ErrorRecoveryExecutor")
      .field("retrying", &self.is_retrying())
      .field("retry_count", &self.retry_count())
      .field("max_delay", &self.max_delay)
      .finish()
  }
}
