//! Optimistic writes: apply locally first, then confirm or roll back.

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{updater, CacheStore, Confirmation, Updater, WriteId};
use crate::error::{CacheError, CacheResult};
use crate::notify::Notifier;
use crate::retry::ErrorRecoveryExecutor;

/// Messages and side effects attached to one mutation
#[derive(Debug, Clone, Default)]
pub struct MutationOptions {
  /// Shown on success; a generic message is used when unset
  pub success_message: Option<String>,
  /// Prefix of the error shown on failure
  pub error_message: Option<String>,
  /// Key prefixes to invalidate once the write is confirmed
  pub invalidate: Vec<String>,
  /// Overrides the adaptive retry budget for the remote write
  pub retry: Option<u32>,
}

impl MutationOptions {
  pub fn with_messages(success: impl Into<String>, error: impl Into<String>) -> Self {
    Self {
      success_message: Some(success.into()),
      error_message: Some(error.into()),
      ..Default::default()
    }
  }

  pub fn invalidating(mut self, prefix: impl Into<String>) -> Self {
    self.invalidate.push(prefix.into());
    self
  }

  pub fn with_retry(mut self, retry: u32) -> Self {
    self.retry = Some(retry);
    self
  }
}

/// Rolls the write back if the mutation future is dropped before it resolves
struct PendingWriteGuard {
  store: CacheStore,
  key: String,
  id: Option<WriteId>,
}

impl PendingWriteGuard {
  fn disarm(&mut self) -> Option<WriteId> {
    self.id.take()
  }
}

impl Drop for PendingWriteGuard {
  fn drop(&mut self) {
    if let Some(id) = self.id.take() {
      debug!(key = %self.key, "mutation dropped before completion");
      self.store.rollback_write(&self.key, id);
    }
  }
}

/// Coordinates writes that must look instantaneous to the user.
///
/// Every `mutate*` call applies its optimistic update before returning, so
/// writes to the same key are applied in submission order even if their
/// futures are awaited later. Each write sits on the key's undo stack until
/// the remote operation resolves.
#[derive(Clone)]
pub struct OptimisticMutationExecutor {
  store: CacheStore,
  notifier: Arc<dyn Notifier>,
  retry_base_delay: Duration,
  temp_ids: Arc<AtomicU64>,
}

impl OptimisticMutationExecutor {
  pub fn new(store: CacheStore, notifier: Arc<dyn Notifier>) -> Self {
    Self {
      store,
      notifier,
      retry_base_delay: Duration::from_secs(1),
      temp_ids: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
    self.retry_base_delay = delay;
    self
  }

  /// Apply `optimistic` to `key` now, then run `remote`.
  ///
  /// On success the server's body, if any, replaces the optimistic value;
  /// on failure the entry is rolled back and the error returned.
  pub fn mutate<F, Fut>(
    &self,
    key: &str,
    optimistic: Updater,
    remote: F,
    options: MutationOptions,
  ) -> BoxFuture<'static, CacheResult<Option<Value>>>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<Option<Value>>> + Send + 'static,
  {
    self.execute(key, optimistic, remote, replace_with_body, options)
  }

  /// Insert `row` into the cached collection at `key`.
  ///
  /// Rows without an `id` get a temporary one, swapped for the server's row
  /// once the remote insert returns it.
  pub fn mutate_create<F, Fut>(
    &self,
    key: &str,
    row: Value,
    remote: F,
    options: MutationOptions,
  ) -> BoxFuture<'static, CacheResult<Option<Value>>>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<Option<Value>>> + Send + 'static,
  {
    if !row.is_object() {
      return future::ready(Err(CacheError::Decode("row must be a JSON object".into()))).boxed();
    }

    let mut row = row;
    if row.get("id").is_none() {
      let n = self.temp_ids.fetch_add(1, Ordering::Relaxed) + 1;
      row["id"] = json!(format!("temp-{}", n));
    }
    let temp_id = row["id"].clone();

    let optimistic = updater(move |data| insert_row(data, &row));
    let reconcile = move |body: Option<&Value>| match first_row(body) {
      Some(server_row) => {
        let temp_id = temp_id.clone();
        Confirmation::Transform(updater(move |data| replace_row(data, &temp_id, &server_row)))
      }
      None => Confirmation::Keep,
    };
    self.execute(key, optimistic, remote, reconcile, options)
  }

  /// Merge `patch` into the row with `id` (or into the cached row itself).
  pub fn mutate_update<F, Fut>(
    &self,
    key: &str,
    id: Value,
    patch: Value,
    remote: F,
    options: MutationOptions,
  ) -> BoxFuture<'static, CacheResult<Option<Value>>>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<Option<Value>>> + Send + 'static,
  {
    let row_id = id.clone();
    let optimistic = updater(move |data| patch_row(data, &row_id, &patch));
    let reconcile = move |body: Option<&Value>| match first_row(body) {
      Some(server_row) => {
        let id = id.clone();
        Confirmation::Transform(updater(move |data| replace_row(data, &id, &server_row)))
      }
      None => Confirmation::Keep,
    };
    self.execute(key, optimistic, remote, reconcile, options)
  }

  /// Remove the row with `id` from the cached collection at `key`.
  pub fn mutate_delete<F, Fut>(
    &self,
    key: &str,
    id: Value,
    remote: F,
    options: MutationOptions,
  ) -> BoxFuture<'static, CacheResult<Option<Value>>>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<Option<Value>>> + Send + 'static,
  {
    let optimistic = updater(move |data| remove_row(data, &id));
    self.execute(key, optimistic, remote, |_| Confirmation::Keep, options)
  }

  fn execute<F, Fut, R>(
    &self,
    key: &str,
    optimistic: Updater,
    remote: F,
    reconcile: R,
    options: MutationOptions,
  ) -> BoxFuture<'static, CacheResult<Option<Value>>>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<Option<Value>>> + Send + 'static,
    R: FnOnce(Option<&Value>) -> Confirmation + Send + 'static,
  {
    // Applied before the future is polled: submission order is application order
    let id = match self.store.begin_write(key, optimistic) {
      Ok(id) => id,
      Err(e) => return future::ready(Err(e)).boxed(),
    };

    let store = self.store.clone();
    let notifier = Arc::clone(&self.notifier);
    let base_delay = self.retry_base_delay;
    let budget = options
      .retry
      .unwrap_or(store.adaptive().current().retry_budget);
    let mut guard = PendingWriteGuard {
      store: store.clone(),
      key: key.to_string(),
      id: Some(id),
    };

    async move {
      let result = ErrorRecoveryExecutor::new()
        .execute_with_retry(&remote, budget, base_delay)
        .await;
      let Some(id) = guard.disarm() else {
        return Err(CacheError::Cancelled);
      };
      let key = guard.key.clone();

      match result {
        Ok(body) => {
          store.confirm_write(&key, id, reconcile(body.as_ref()));
          for prefix in &options.invalidate {
            store.invalidate_matching(prefix);
          }
          debug!(%key, "mutation confirmed");
          notifier.success(options.success_message.as_deref().unwrap_or("Changes saved"));
          Ok(body)
        }
        Err(error) => {
          store.rollback_write(&key, id);
          warn!(%key, %error, "mutation failed, rolled back");
          let prefix = options
            .error_message
            .as_deref()
            .unwrap_or("Could not save changes");
          notifier.error(&format!("{}: {}", prefix, error));
          Err(error)
        }
      }
    }
    .boxed()
  }
}

fn replace_with_body(body: Option<&Value>) -> Confirmation {
  match body {
    Some(value) => Confirmation::Replace(value.clone()),
    None => Confirmation::Keep,
  }
}

/// Backends that return representations often wrap a single row in an array
fn first_row(body: Option<&Value>) -> Option<Value> {
  match body? {
    Value::Array(rows) => rows.first().cloned(),
    Value::Null => None,
    row => Some(row.clone()),
  }
}

fn has_id(row: &Value, id: &Value) -> bool {
  row.get("id") == Some(id)
}

/// Insert `row` at the front of a collection, replacing a row with the same id.
pub fn insert_row(data: Option<&Value>, row: &Value) -> Value {
  let mut rows = match data {
    Some(Value::Array(rows)) => rows.clone(),
    _ => Vec::new(),
  };
  match row.get("id").and_then(|id| rows.iter().position(|r| has_id(r, id))) {
    Some(idx) => rows[idx] = row.clone(),
    None => rows.insert(0, row.clone()),
  }
  Value::Array(rows)
}

/// Merge the fields of `patch` into the row with `id`.
///
/// Works on a collection or on a single cached row.
pub fn patch_row(data: Option<&Value>, id: &Value, patch: &Value) -> Value {
  fn merge(row: &mut Value, patch: &Value) {
    if let (Value::Object(fields), Value::Object(changes)) = (row, patch) {
      for (k, v) in changes {
        fields.insert(k.clone(), v.clone());
      }
    }
  }

  let mut value = data.cloned().unwrap_or(Value::Null);
  match &mut value {
    Value::Array(rows) => rows
      .iter_mut()
      .filter(|r| has_id(r, id))
      .for_each(|r| merge(r, patch)),
    row if has_id(&*row, id) => merge(row, patch),
    _ => {}
  }
  value
}

/// Replace the row with `id` by `row`, on a collection or a single cached row.
pub fn replace_row(data: Option<&Value>, id: &Value, row: &Value) -> Value {
  match data {
    Some(Value::Array(rows)) => Value::Array(
      rows
        .iter()
        .map(|r| if has_id(r, id) { row.clone() } else { r.clone() })
        .collect(),
    ),
    Some(current) if has_id(current, id) => row.clone(),
    Some(current) => current.clone(),
    None => Value::Null,
  }
}

/// Remove the row with `id` from a collection.
pub fn remove_row(data: Option<&Value>, id: &Value) -> Value {
  match data {
    Some(Value::Array(rows)) => Value::Array(rows.iter().filter(|r| !has_id(r, id)).cloned().collect()),
    Some(current) if has_id(current, id) => Value::Null,
    Some(current) => current.clone(),
    None => Value::Array(Vec::new()),
  }
}
