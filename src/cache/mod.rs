//! In-memory caching layer with stale-while-revalidate reads.
//!
//! This module provides the store behind every UI read:
//! - Caches backend responses per logical key, with freshness metadata
//! - Deduplicates concurrent fetches of the same key
//! - Revalidates stale entries in the background
//! - Orders fetch results and optimistic writes by per-key sequence numbers
//! - Keeps an ordered undo stack of optimistic writes for rollback

mod entry;
mod keys;
mod store;
mod traits;

pub use entry::{updater, Confirmation, FetchHandle, Updater};
pub use keys::ClinicQueryKey;
pub use store::{CacheSettings, CacheStore, WriteId};
pub use traits::{CacheStatus, QueryKey, ReadOptions, ReadResult};
