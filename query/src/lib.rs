#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About Query Core
//!
//!
//! Query Core is a keyed, asynchronous state cache for data that lives on a server.
//!
//! Heavily inspired by [Tanstack Query](https://tanstack.com/query/latest/).
//!
//! Queries are useful for data fetching, caching, and synchronization with server state.
//!
//! A Query provides:
//! - caching under structured, order-insensitive keys
//! - de-duplication of concurrent fetches
//! - invalidation, exact or by key prefix
//! - stale-while-revalidate
//! - memory management with cache lifetimes and a size ceiling
//! - cancellation
//! - structural sharing of unchanged data
//! - mutations that invalidate the queries they affect
//! - dehydration and hydration of the cache
//!
//! Everything is single threaded. Time, timers and task spawning come from a [`QueryRuntime`]:
//! [`ManualRuntime`] for tests and deterministic embedding, `TokioRuntime` inside a tokio
//! `LocalSet`.
//!
//! ## The main entry points are:
//! - [`QueryClient`] - Owns the cache. Fetch, read, write, invalidate and remove queries.
//! - [`QueryObserver`] - Binds one consumer to one key and keeps a derived
//!   [`QueryObserverResult`] up to date.
//! - [`Mutation`] - Runs side effects and invalidates queries when they succeed.
//!
//! # Feature Flags
//! - `tokio` (default): Enables `TokioRuntime`.
//!
//! # A Simple Example
//!
//! ```
//! use std::rc::Rc;
//! use query_core::*;
//!
//! let runtime = ManualRuntime::new();
//! let client = QueryClient::new(QueryClientConfig::default(), Rc::new(runtime.clone()));
//!
//! // Query fetcher.
//! let get_track = query_fn(|| async { Ok::<_, FetchError>("Blue in Green".to_string()) });
//!
//! // Observing a key fetches it.
//! let observer = client
//!     .observer(
//!         &query_key!["track", 1],
//!         get_track,
//!         QueryObserverOptions::new(client.default_options()),
//!     )
//!     .unwrap();
//! assert!(observer.get_current_result().is_loading);
//!
//! runtime.run_until_stalled();
//! let result = observer.get_current_result();
//! assert_eq!(result.data.as_deref(), Some("Blue in Green"));
//! assert!(result.is_success);
//! ```

/// Subcriptions to cache-wide query events.
pub mod cache_observer;
mod error;
mod garbage_collector;
mod hydration;
mod instant;
mod mutation;
mod query;
mod query_cache;
mod query_client;
mod query_executor;
mod query_fn;
mod query_key;
mod query_observer;
mod query_options;
mod query_state;
/// Clocks, timers and task spawning.
pub mod runtime;
mod structural_sharing;
mod value;

pub use cache_observer::{CacheEvent, CacheObserver, RemovalReason};
pub use error::*;
pub use hydration::*;
pub use instant::*;
pub use mutation::*;
pub use query::SubscriberKey;
pub use query_cache::{CacheObserverKey, CacheStats, QueryCache, QueryInfo};
pub use query_client::*;
pub use query_executor::QueryFuture;
pub use query_fn::*;
pub use query_key::*;
pub use query_observer::*;
pub use query_options::*;
pub use query_state::*;
pub use runtime::{ManualRuntime, QueryRuntime, TimeoutHandle};
#[cfg(feature = "tokio")]
pub use runtime::TokioRuntime;
pub use structural_sharing::*;
pub use value::*;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}

/// Convenience trait for query value requirements.
///
/// Values are cloned out of the cache, serialized for dehydration and structurally shared
/// between refetches.
pub trait QueryValue:
    std::fmt::Debug + Clone + serde::Serialize + serde::de::DeserializeOwned + StructuralShare + 'static
{
}
impl<V> QueryValue for V where
    V: std::fmt::Debug
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + StructuralShare
        + 'static
{
}
