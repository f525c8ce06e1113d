//! Deduplicating fetch cache with per-caller cancellation.
//!
//! Concurrent [`get`](AbortableCache::get)s for the same key share a single [`Fill`]
//! operation. Every caller can withdraw on its own via a
//! [`CancellationToken`](tokio_util::sync::CancellationToken); the fill itself is only cancelled
//! once ALL callers withdrew. Status messages of the fill are fanned out to every caller.
//!
//! Failed and cancelled fills are removed from the [`Store`] so the next request retries.
//!
//! ```
//! use std::sync::Arc;
//!
//! use abortable_cache::{AbortableCache, DynError, StatusEmitter};
//! use clap_blocks::abortable_cache::AbortableCacheConfig;
//! use futures::FutureExt;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let fill = |n: u64, _token: CancellationToken, status: StatusEmitter<String>| {
//!     async move {
//!         status.emit(format!("squaring {n}"));
//!         Ok::<_, DynError>(n * n)
//!     }
//!     .boxed()
//! };
//! let cache = AbortableCache::with_config(&AbortableCacheConfig::default(), fill);
//!
//! let seen = Arc::new(parking_lot::Mutex::new(vec![]));
//! let seen_captured = Arc::clone(&seen);
//! let req = cache
//!     .get(
//!         "four",
//!         4,
//!         Some(CancellationToken::new()),
//!         Some(Arc::new(move |msg: &String| seen_captured.lock().push(msg.clone()))),
//!     )
//!     .unwrap();
//! assert_eq!(*req.await.unwrap(), 16);
//! assert_eq!(*seen.lock(), vec!["squaring 4"]);
//! # }
//! ```

pub mod aggregate;
pub mod cache;
pub mod error;
pub mod flight;
pub mod status;
pub mod store;
mod task;

#[cfg(test)]
mod test_utils;

pub use aggregate::AggregateCancellation;
pub use cache::{AbortableCache, CacheRequest, CacheState, Fill};
pub use error::{is_abort_error, DynError, Error};
pub use flight::{Flight, Slot};
pub use status::{StatusCallback, StatusEmitter, StatusFanout};
pub use store::{HashMapStore, LruStore, Store};
