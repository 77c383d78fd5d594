//! Per-key cache state and the ordered undo stack of optimistic writes.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::traits::{CacheStatus, ReadResult};
use crate::error::{CacheError, CacheResult};
use crate::retry::ErrorRecoveryExecutor;

/// Pure transform applied to cached data by an optimistic write
pub type Updater = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// Box a closure into an [`Updater`]
pub fn updater<F>(f: F) -> Updater
where
  F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
{
  Arc::new(f)
}

/// Handle to an in-flight fetch; every clone resolves to the same result
pub type FetchHandle = Shared<BoxFuture<'static, CacheResult<Value>>>;

/// How a confirmed optimistic write reconciles with the server's answer
#[derive(Clone)]
pub enum Confirmation {
  /// The server returned no body; keep the optimistic value
  Keep,
  /// The server returned the full authoritative value
  Replace(Value),
  /// Reconcile by transforming the cached value (e.g. swap a temporary row
  /// for the server's row)
  Transform(Updater),
}

/// One optimistic write awaiting its remote outcome
pub(crate) struct PendingWrite {
  pub id: u64,
  /// Data immediately before this write was applied
  pub prior: Option<Value>,
  pub apply: Updater,
  /// Confirmed, but kept because an earlier write is still pending
  pub settled: bool,
}

pub(crate) struct InFlight {
  pub seq: u64,
  pub handle: FetchHandle,
  pub abort: AbortHandle,
  pub retry: ErrorRecoveryExecutor,
}

/// Freshness and retention windows in effect for one read
#[derive(Debug, Clone, Copy)]
pub(crate) struct Windows {
  pub freshness: Duration,
  pub retention: Duration,
}

/// Cached state for one logical resource.
#[derive(Default)]
pub(crate) struct CacheEntry {
  pub data: Option<Value>,
  pub fetched_at: Option<Instant>,
  pub fetched_at_utc: Option<DateTime<Utc>>,
  pub last_error: Option<CacheError>,
  pub failed_at: Option<Instant>,
  /// Last fetch result, failure or write
  pub touched_at: Option<Instant>,
  /// Retention window of the most recent read
  pub retention: Option<Duration>,
  pub in_flight: Option<InFlight>,
  /// Last sequence number handed out
  last_seq: u64,
  /// Sequence number of the write currently reflected in `data`
  pub accepted_seq: u64,
  /// Optimistic writes in application order
  pub pending: Vec<PendingWrite>,
}

impl CacheEntry {
  pub fn next_seq(&mut self) -> u64 {
    self.last_seq += 1;
    self.last_seq
  }

  pub fn status(&self, now: Instant, windows: Windows) -> CacheStatus {
    if self.in_flight.is_some() {
      return if self.data.is_some() {
        CacheStatus::Revalidating
      } else {
        CacheStatus::Loading
      };
    }
    if self.last_error.is_some() {
      return CacheStatus::Error;
    }
    match (&self.data, self.fetched_at) {
      (None, _) => CacheStatus::Empty,
      // Only optimistic data so far
      (Some(_), None) => CacheStatus::Stale,
      (Some(_), Some(at)) if now.duration_since(at) > windows.freshness => CacheStatus::Stale,
      (Some(_), Some(_)) => CacheStatus::Fresh,
    }
  }

  /// Fetched data outlived the retention window and nothing depends on it
  pub fn is_expired(&self, now: Instant, retention: Duration) -> bool {
    self.in_flight.is_none()
      && self.pending.is_empty()
      && self
        .fetched_at
        .is_some_and(|at| now.duration_since(at) > retention)
  }

  /// Nothing is fetching or writing, and the entry is either empty or has
  /// not been touched within its retention window
  pub fn is_collectable(&self, now: Instant, default_retention: Duration) -> bool {
    if self.in_flight.is_some() || !self.pending.is_empty() {
      return false;
    }
    if self.data.is_none() && self.last_error.is_none() {
      return true;
    }
    let retention = self.retention.unwrap_or(default_retention);
    self
      .touched_at
      .map_or(true, |at| now.duration_since(at) > retention)
  }

  /// A failed entry may be retried by a read once the freshness window has passed
  pub fn error_retry_due(&self, now: Instant, freshness: Duration) -> bool {
    self
      .failed_at
      .map_or(true, |at| now.duration_since(at) > freshness)
  }

  /// Drop data and metadata so the next read starts from scratch.
  pub fn clear(&mut self) {
    self.data = None;
    self.fetched_at = None;
    self.fetched_at_utc = None;
    self.last_error = None;
    self.failed_at = None;
  }

  pub fn snapshot(&self, status: CacheStatus) -> ReadResult {
    ReadResult {
      data: self.data.clone(),
      status,
      error: if status == CacheStatus::Error {
        self.last_error.clone()
      } else {
        None
      },
      fetched_at: self.fetched_at_utc,
    }
  }

  /// Accept a fetch result unless a newer write has already been accepted.
  ///
  /// Unsettled optimistic writes are re-applied on top of the fetched value;
  /// settled ones are assumed to be reflected by the server.
  pub fn accept_fetch(&mut self, seq: u64, value: Value, now: Instant) -> bool {
    if seq <= self.accepted_seq {
      return false;
    }
    self.accepted_seq = seq;
    self.fetched_at = Some(now);
    self.touched_at = Some(now);
    self.fetched_at_utc = Some(Utc::now());
    self.last_error = None;
    self.failed_at = None;
    self.pending.retain(|w| !w.settled);
    self.rebuild(0, Some(value));
    true
  }

  /// Record a failed fetch, keeping whatever data is cached.
  pub fn record_failure(&mut self, error: CacheError, now: Instant) {
    self.last_error = Some(error);
    self.failed_at = Some(now);
    self.touched_at = Some(now);
  }

  /// Apply an optimistic write on top of the current data.
  pub fn apply_write(&mut self, id: u64, apply: Updater, now: Instant) {
    let seq = self.next_seq();
    self.touched_at = Some(now);
    let prior = self.data.clone();
    self.data = Some(apply(prior.as_ref()));
    self.accepted_seq = seq;
    self.pending.push(PendingWrite {
      id,
      prior,
      apply,
      settled: false,
    });
  }

  /// Confirm a pending write. Returns false if the write is unknown.
  pub fn settle_write(&mut self, id: u64, confirmation: Confirmation) -> bool {
    let Some(idx) = self.pending.iter().position(|w| w.id == id) else {
      return false;
    };

    let write = &mut self.pending[idx];
    write.settled = true;
    let reconciled = match confirmation {
      Confirmation::Keep => false,
      Confirmation::Replace(value) => {
        write.apply = updater(move |_| value.clone());
        true
      }
      Confirmation::Transform(reconcile) => {
        let optimistic = Arc::clone(&write.apply);
        write.apply = updater(move |data| {
          let applied = optimistic(data);
          reconcile(Some(&applied))
        });
        true
      }
    };

    if reconciled {
      let base = self.pending[idx].prior.clone();
      self.rebuild(idx, base);
    }
    self.prune_settled();
    true
  }

  /// Undo a pending write.
  ///
  /// Data is restored to the state immediately preceding that write, then
  /// every later write is re-applied so their effects survive.
  pub fn rollback_write(&mut self, id: u64) -> bool {
    let Some(idx) = self.pending.iter().position(|w| w.id == id) else {
      return false;
    };
    let write = self.pending.remove(idx);
    self.rebuild(idx, write.prior);
    self.prune_settled();
    true
  }

  /// Re-apply writes from `from` onward on top of `base`
  fn rebuild(&mut self, from: usize, mut base: Option<Value>) {
    for write in &mut self.pending[from..] {
      let next = (write.apply)(base.as_ref());
      write.prior = base;
      base = Some(next);
    }
    self.data = base;
  }

  /// Settled writes at the bottom of the stack can no longer be rolled past
  fn prune_settled(&mut self) {
    let settled = self.pending.iter().take_while(|w| w.settled).count();
    self.pending.drain(..settled);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn set_field(field: &'static str, value: Value) -> Updater {
    updater(move |data| {
      let mut obj = data.cloned().unwrap_or_else(|| json!({}));
      obj[field] = value.clone();
      obj
    })
  }

  fn entry_with(value: Value) -> CacheEntry {
    let mut entry = CacheEntry::default();
    let seq = entry.next_seq();
    assert!(entry.accept_fetch(seq, value, Instant::now()));
    entry
  }

  #[test]
  fn test_older_fetch_cannot_overwrite_newer() {
    let mut entry = CacheEntry::default();
    let older = entry.next_seq();
    let newer = entry.next_seq();
    let now = Instant::now();

    assert!(entry.accept_fetch(newer, json!("B"), now));
    assert!(!entry.accept_fetch(older, json!("A"), now));
    assert_eq!(entry.data, Some(json!("B")));
  }

  #[test]
  fn test_rollback_restores_prior_value() {
    let mut entry = entry_with(json!({"status": "PENDING"}));
    entry.apply_write(1, set_field("status", json!("CONFIRMED")), Instant::now());
    assert_eq!(entry.data, Some(json!({"status": "CONFIRMED"})));

    assert!(entry.rollback_write(1));
    assert_eq!(entry.data, Some(json!({"status": "PENDING"})));
    assert!(entry.pending.is_empty());
  }

  #[test]
  fn test_rollback_of_earlier_write_keeps_later_effect() {
    let mut entry = entry_with(json!({"status": "PENDING", "notes": ""}));
    entry.apply_write(1, set_field("status", json!("CONFIRMED")), Instant::now());
    entry.apply_write(2, set_field("notes", json!("x")), Instant::now());

    assert!(entry.rollback_write(1));
    assert_eq!(entry.data, Some(json!({"status": "PENDING", "notes": "x"})));

    // Rolling back the second write now returns to the original value
    assert!(entry.rollback_write(2));
    assert_eq!(entry.data, Some(json!({"status": "PENDING", "notes": ""})));
  }

  #[test]
  fn test_settled_write_survives_rollback_of_earlier_write() {
    let mut entry = entry_with(json!({"a": 0, "b": 0}));
    entry.apply_write(1, set_field("a", json!(1)), Instant::now());
    entry.apply_write(2, set_field("b", json!(2)), Instant::now());

    assert!(entry.settle_write(2, Confirmation::Keep));
    assert_eq!(entry.pending.len(), 2);

    assert!(entry.rollback_write(1));
    assert_eq!(entry.data, Some(json!({"a": 0, "b": 2})));
    assert!(entry.pending.is_empty());
  }

  #[test]
  fn test_replace_confirmation_rebases_later_writes() {
    let mut entry = entry_with(json!({"status": "PENDING"}));
    entry.apply_write(1, set_field("status", json!("CONFIRMED")), Instant::now());
    entry.apply_write(2, set_field("notes", json!("x")), Instant::now());

    let server = json!({"status": "CONFIRMED", "updated_by": "server"});
    assert!(entry.settle_write(1, Confirmation::Replace(server)));
    assert_eq!(
      entry.data,
      Some(json!({"status": "CONFIRMED", "updated_by": "server", "notes": "x"}))
    );
    assert_eq!(entry.pending.len(), 1);
  }

  #[test]
  fn test_fetch_result_is_rebased_under_pending_writes() {
    let mut entry = entry_with(json!({"status": "PENDING"}));
    entry.apply_write(1, set_field("notes", json!("x")), Instant::now());

    let seq = entry.next_seq();
    assert!(entry.accept_fetch(seq, json!({"status": "DONE"}), Instant::now()));
    assert_eq!(entry.data, Some(json!({"status": "DONE", "notes": "x"})));

    assert!(entry.rollback_write(1));
    assert_eq!(entry.data, Some(json!({"status": "DONE"})));
  }

  #[test]
  fn test_failure_keeps_data() {
    let mut entry = entry_with(json!([1, 2]));
    entry.record_failure(CacheError::Offline, Instant::now());
    assert_eq!(entry.data, Some(json!([1, 2])));
    let windows = Windows {
      freshness: Duration::from_secs(60),
      retention: Duration::from_secs(600),
    };
    assert_eq!(entry.status(Instant::now(), windows), CacheStatus::Error);
  }

  #[test]
  fn test_failed_or_optimistic_only_entries_become_collectable() {
    let start = Instant::now();
    let retention = Duration::from_secs(600);
    let later = start + Duration::from_secs(601);

    let mut failed = CacheEntry::default();
    failed.record_failure(CacheError::Status { status: 404, message: String::new() }, start);
    assert!(!failed.is_collectable(start, retention));
    assert!(failed.is_collectable(later, retention));

    let mut optimistic = CacheEntry::default();
    optimistic.apply_write(1, set_field("a", json!(1)), start);
    // Pending writes pin the entry
    assert!(!optimistic.is_collectable(later, retention));
    assert!(optimistic.settle_write(1, Confirmation::Keep));
    assert!(optimistic.is_collectable(later, retention));
  }

  #[test]
  fn test_entry_retention_overrides_default() {
    let start = Instant::now();
    let mut entry = CacheEntry::default();
    let seq = entry.next_seq();
    assert!(entry.accept_fetch(seq, json!(1), start));
    entry.retention = Some(Duration::from_secs(3600));

    let later = start + Duration::from_secs(11 * 60);
    assert!(!entry.is_collectable(later, Duration::from_secs(600)));
    assert!(entry.is_collectable(start + Duration::from_secs(3601), Duration::from_secs(600)));
  }
}
