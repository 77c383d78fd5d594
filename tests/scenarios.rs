//! End-to-end behaviour of the cache, mutation and refresh layers through the
//! public API.

use clinic_cache::cache::updater;
use clinic_cache::{
  fetch_fn, AdaptiveConfigProvider, CacheError, CacheStatus, CacheStore, ConnectionMonitor,
  ConnectionQuality, FetchFn, MutationOptions, Notifier, OptimisticMutationExecutor, ReadOptions,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct Recorder {
  successes: Mutex<Vec<String>>,
  errors: Mutex<Vec<String>>,
}

impl Notifier for Recorder {
  fn success(&self, message: &str) {
    self.successes.lock().unwrap().push(message.to_string());
  }

  fn error(&self, message: &str) {
    self.errors.lock().unwrap().push(message.to_string());
  }
}

fn setup() -> (CacheStore, ConnectionMonitor, Arc<Recorder>) {
  let monitor = ConnectionMonitor::default();
  let recorder = Arc::new(Recorder::default());
  let store = CacheStore::new(AdaptiveConfigProvider::new(monitor.clone())).with_notifier(recorder.clone());
  (store, monitor, recorder)
}

/// Fetcher whose n-th call resolves to `respond(n)` after `delay(n)`
fn scripted<R, D>(respond: R, delay: D) -> (FetchFn, Arc<AtomicUsize>)
where
  R: Fn(usize) -> Result<Value, CacheError> + Send + Sync + 'static,
  D: Fn(usize) -> Duration + Send + Sync + 'static,
{
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = calls.clone();
  let fetcher = fetch_fn(move || {
    let n = counter.fetch_add(1, Ordering::SeqCst);
    let result = respond(n);
    let wait = delay(n);
    async move {
      tokio::time::sleep(wait).await;
      result
    }
  });
  (fetcher, calls)
}

async fn settle() {
  tokio::time::sleep(Duration::from_millis(1)).await;
}

fn rows(value: &Option<Value>) -> usize {
  value.as_ref().and_then(Value::as_array).map_or(0, Vec::len)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_fetch() {
  let (store, _, _) = setup();
  let (fetcher, calls) = scripted(|_| Ok(json!(["a"])), |_| Duration::from_millis(50));
  let options = ReadOptions::default();

  for _ in 0..10 {
    let result = store.read("patients:all", &fetcher, &options).unwrap();
    assert_eq!(result.status, CacheStatus::Loading);
  }
  let waiters: Vec<_> = (0..5)
    .map(|_| {
      let store = store.clone();
      let fetcher = fetcher.clone();
      tokio::spawn(async move { store.fetch("patients:all", &fetcher, &ReadOptions::default()).await })
    })
    .collect();
  for waiter in waiters {
    assert_eq!(waiter.await.unwrap(), Ok(json!(["a"])));
  }

  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_older_fetch_is_discarded() {
  let (store, _, _) = setup();
  let (fetcher, _) = scripted(
    |n| Ok(json!(if n == 0 { "A" } else { "B" })),
    |n| Duration::from_millis(if n == 0 { 200 } else { 50 }),
  );
  let options = ReadOptions::default();

  let first = store.refetch("k", &fetcher, &options).unwrap();
  tokio::time::sleep(Duration::from_millis(10)).await;
  let second = store.refetch("k", &fetcher, &options).unwrap();

  assert_eq!(second.await, Ok(json!("B")));
  assert_eq!(first.await, Ok(json!("A")));
  assert_eq!(store.peek("k", &options).data, Some(json!("B")));
}

#[tokio::test(start_paused = true)]
async fn test_failed_mutation_restores_exact_prior_value() {
  let (store, _, recorder) = setup();
  let before = json!({"id": 1, "name": "Ana", "tags": ["a", "b"]});
  let initial = before.clone();
  let fetcher = fetch_fn(move || {
    let value = initial.clone();
    async move { Ok(value) }
  });
  store.fetch("patient:1", &fetcher, &ReadOptions::default()).await.unwrap();

  let executor = OptimisticMutationExecutor::new(store.clone(), recorder.clone());
  let result = executor
    .mutate(
      "patient:1",
      updater(|_| json!({"id": 1, "name": "Ana Maria", "tags": []})),
      || async {
        Err(CacheError::Status {
          status: 422,
          message: "invalid".into(),
        })
      },
      MutationOptions::with_messages("Saved", "Could not save patient"),
    )
    .await;

  assert!(result.is_err());
  assert_eq!(store.peek("patient:1", &ReadOptions::default()).data, Some(before));
  assert_eq!(recorder.errors.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_never_drops_data() {
  let (store, _, _) = setup();
  let (fetcher, _) = scripted(
    |n| if n == 0 { Ok(json!([1, 2, 3])) } else { Err(CacheError::Status { status: 400, message: "bad".into() }) },
    |_| Duration::ZERO,
  );
  let options = ReadOptions::default().with_stale_time(Duration::ZERO);

  store.fetch("k", &fetcher, &options).await.unwrap();
  tokio::time::advance(Duration::from_millis(1)).await;
  assert!(store.refetch("k", &fetcher, &options).unwrap().await.is_err());

  let result = store.peek("k", &options);
  assert_eq!(result.status, CacheStatus::Error);
  assert_eq!(result.data, Some(json!([1, 2, 3])));
}

#[tokio::test(start_paused = true)]
async fn test_double_invalidate_matches_single() {
  let (store, _, _) = setup();
  let (fetcher, calls) = scripted(|n| Ok(json!(n)), |_| Duration::ZERO);
  let options = ReadOptions::default();

  store.fetch("k", &fetcher, &options).await.unwrap();
  store.invalidate("k");
  let once = store.peek("k", &options);
  store.invalidate("k");
  assert_eq!(store.peek("k", &options), once);
  assert_eq!(once.status, CacheStatus::Empty);

  assert_eq!(store.read("k", &fetcher, &options).unwrap().status, CacheStatus::Loading);
  settle().await;
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_list_is_served_then_revalidated() {
  let (store, _, _) = setup();
  let (fetcher, calls) = scripted(|n| Ok(json!({"version": n})), |_| Duration::from_millis(20));
  let options = ReadOptions::default().with_stale_time(Duration::from_secs(30));

  store.fetch("patients-list", &fetcher, &options).await.unwrap();
  let fresh = store.read("patients-list", &fetcher, &options).unwrap();
  assert_eq!(fresh.status, CacheStatus::Fresh);
  assert_eq!(fresh.data, Some(json!({"version": 0})));

  tokio::time::advance(Duration::from_secs(45)).await;
  let stale = store.read("patients-list", &fetcher, &options).unwrap();
  assert_eq!(stale.status, CacheStatus::Stale);
  assert_eq!(stale.data, Some(json!({"version": 0})));
  assert_eq!(
    store.peek("patients-list", &options).status,
    CacheStatus::Revalidating
  );

  store.settle("patients-list").await.unwrap().unwrap();
  let revalidated = store.read("patients-list", &fetcher, &options).unwrap();
  assert_eq!(revalidated.status, CacheStatus::Fresh);
  assert_eq!(revalidated.data, Some(json!({"version": 1})));
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_delete_restores_full_list() {
  let (store, _, _) = setup();
  let list: Value = (1..=10).map(|id| json!({"id": id})).collect();
  let initial = list.clone();
  let fetcher = fetch_fn(move || {
    let value = initial.clone();
    async move { Ok(value) }
  });
  let options = ReadOptions::default();
  store.fetch("appointments", &fetcher, &options).await.unwrap();

  let executor = OptimisticMutationExecutor::new(store.clone(), Arc::new(Recorder::default()));
  let pending = executor.mutate_delete(
    "appointments",
    json!(7),
    || async { Err(CacheError::Network("connection reset".into())) },
    MutationOptions::default().with_retry(0),
  );

  let during = store.read("appointments", &fetcher, &options).unwrap();
  assert_eq!(rows(&during.data), 9);

  assert!(pending.await.is_err());
  let after = store.read("appointments", &fetcher, &options).unwrap();
  assert_eq!(rows(&after.data), 10);
  assert_eq!(after.data, Some(list));
}

#[tokio::test(start_paused = true)]
async fn test_offline_read_fails_without_retry_delay() {
  let (store, monitor, recorder) = setup();
  monitor.set_online(false);
  assert_eq!(monitor.quality(), ConnectionQuality::Offline);
  assert_eq!(store.adaptive().current().retry_budget, 0);

  let (fetcher, calls) = scripted(|_| Err(CacheError::Offline), |_| Duration::ZERO);
  let options = ReadOptions::default();
  let started = Instant::now();

  assert_eq!(store.read("exercises", &fetcher, &options).unwrap().status, CacheStatus::Loading);
  assert_eq!(store.settle("exercises").await, Some(Err(CacheError::Offline)));

  let result = store.read("exercises", &fetcher, &options).unwrap();
  assert_eq!(result.status, CacheStatus::Error);
  assert_eq!(result.error, Some(CacheError::Offline));
  assert_eq!(result.data, None);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(started.elapsed() < Duration::from_millis(10));
  assert_eq!(recorder.errors.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_mutations_compose() {
  let (store, _, recorder) = setup();
  let fetcher = fetch_fn(|| async { Ok(json!({"id": 3, "status": "PENDING", "notes": ""})) });
  store.fetch("appointment:3", &fetcher, &ReadOptions::default()).await.unwrap();

  let executor = OptimisticMutationExecutor::new(store.clone(), recorder.clone());
  let confirm = executor.mutate_update(
    "appointment:3",
    json!(3),
    json!({"status": "CONFIRMED"}),
    || async {
      tokio::time::sleep(Duration::from_millis(30)).await;
      Ok(None)
    },
    MutationOptions::default(),
  );
  let annotate = executor.mutate_update(
    "appointment:3",
    json!(3),
    json!({"notes": "x"}),
    || async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      Ok(None)
    },
    MutationOptions::default(),
  );

  let (confirm, annotate) = tokio::join!(confirm, annotate);
  assert!(confirm.is_ok() && annotate.is_ok());

  let data = store.peek("appointment:3", &ReadOptions::default()).data.unwrap();
  assert_eq!(data["status"], "CONFIRMED");
  assert_eq!(data["notes"], "x");
  assert_eq!(store.pending_writes("appointment:3"), 0);
  assert_eq!(recorder.successes.lock().unwrap().len(), 2);
}
