//! Client-side data freshness and optimistic mutation layer.
//!
//! Screens read through a shared [`CacheStore`] that serves cached data
//! immediately and revalidates it in the background, write through the
//! [`OptimisticMutationExecutor`], and stay current via the
//! [`SmartRefreshScheduler`]. Windows and retry budgets adapt to the
//! connection quality reported by the [`ConnectionMonitor`].

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod logging;
pub mod mutation;
pub mod network;
pub mod notify;
pub mod query;
pub mod refresh;
pub mod retry;

pub use cache::{CacheStatus, CacheStore, ClinicQueryKey, QueryKey, ReadOptions, ReadResult};
pub use error::{CacheError, CacheResult};
pub use event::{LifecycleBus, LifecycleEvent};
pub use fetch::{fetch_fn, FetchFn, HttpFetcher};
pub use mutation::{MutationOptions, OptimisticMutationExecutor};
pub use network::{AdaptiveConfigProvider, ConnectionMonitor, ConnectionQuality};
pub use notify::{LogNotifier, Notifier};
pub use query::Query;
pub use refresh::{RefreshPolicy, SmartRefreshScheduler};
pub use retry::ErrorRecoveryExecutor;
