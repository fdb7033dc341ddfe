use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of a [`QueryClient`](crate::QueryClient) and its cache.
///
/// Deserializes from a map with durations in milliseconds, where `null` means "never":
///
/// ```
/// use query_core::QueryClientConfig;
/// use std::time::Duration;
///
/// let config: QueryClientConfig =
///     serde_json::from_str(r#"{ "max_queries": 2, "stale_time": null }"#).unwrap();
/// assert_eq!(config.max_queries, 2);
/// assert_eq!(config.stale_time, None);
/// assert_eq!(config.gc_time, Some(Duration::from_secs(300)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryClientConfig {
    /// Ceiling on the number of cached queries.
    /// Idle queries beyond it are evicted, least recently used first.
    /// Default is 100.
    pub max_queries: usize,
    /// Default stale time of every query.
    /// If no stale_time, data never goes stale by age.
    /// Default is zero: data is stale as soon as time has passed since it was fetched.
    #[serde(with = "millis")]
    pub stale_time: Option<Duration>,
    /// Default time an unobserved query stays in the cache.
    /// If no gc_time, queries are never garbage collected.
    /// Default is 5 minutes.
    #[serde(with = "millis")]
    pub gc_time: Option<Duration>,
}

const DEFAULT_MAX_QUERIES: usize = 100;
const DEFAULT_STALE_TIME: Duration = Duration::ZERO;
const DEFAULT_GC_TIME: Duration = Duration::from_secs(60 * 5);

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            max_queries: DEFAULT_MAX_QUERIES,
            stale_time: Some(DEFAULT_STALE_TIME),
            gc_time: Some(DEFAULT_GC_TIME),
        }
    }
}

impl QueryClientConfig {
    /// Set the query ceiling.
    pub fn set_max_queries(self, max_queries: usize) -> Self {
        QueryClientConfig {
            max_queries,
            ..self
        }
    }

    /// Set the default stale_time.
    pub fn set_stale_time(self, stale_time: Option<Duration>) -> Self {
        QueryClientConfig { stale_time, ..self }
    }

    /// Set the default gc time.
    pub fn set_gc_time(self, gc_time: Option<Duration>) -> Self {
        QueryClientConfig { gc_time, ..self }
    }

    /// Options for a single query that pin these defaults explicitly.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            stale_time: Some(self.stale_time),
            gc_time: Some(self.gc_time),
            enabled: true,
        }
    }

    /// Fills the durations `options` leaves unset with these defaults and clamps the stale
    /// time to the gc time.
    pub fn resolve(&self, options: &QueryOptions) -> ResolvedQueryOptions {
        let stale_time = options.stale_time.unwrap_or(self.stale_time);
        let gc_time = options.gc_time.unwrap_or(self.gc_time);
        ResolvedQueryOptions {
            stale_time: ensure_valid_stale_time(&stale_time, &gc_time),
            gc_time,
        }
    }
}

/**
 * Options for a single query.
 *
 * Unset durations fall back to the [`QueryClientConfig`] of the cache the query lives in.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// The duration that should pass before a query is considered stale.
    /// If the query is stale, it will be refetched when an observer mounts.
    /// `Some(None)` means the query is never considered stale, `None` uses the client default.
    /// Stale_time can never be greater than gc_time.
    pub stale_time: Option<Option<Duration>>,
    /// The amount of time a query will be cached once it has no observers.
    /// `Some(None)` means the query is never revoked from cache, `None` uses the client default.
    /// NOTE: If different gc times are used for the same key, the MAXIMUM time will be used.
    pub gc_time: Option<Option<Duration>>,
    /// A disabled query never fetches, not even on refetch or invalidation.
    pub enabled: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: None,
            gc_time: None,
            enabled: true,
        }
    }
}

impl QueryOptions {
    /// Override the stale_time.
    pub fn set_stale_time(self, stale_time: Option<Duration>) -> Self {
        QueryOptions {
            stale_time: Some(stale_time),
            ..self
        }
    }

    /// Override the gc time.
    pub fn set_gc_time(self, gc_time: Option<Duration>) -> Self {
        QueryOptions {
            gc_time: Some(gc_time),
            ..self
        }
    }

    /// Enable or disable fetching.
    pub fn set_enabled(self, enabled: bool) -> Self {
        QueryOptions { enabled, ..self }
    }
}

/// Durations of a query once client defaults are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedQueryOptions {
    /// Never greater than `gc_time`. `None` is never stale.
    pub stale_time: Option<Duration>,
    /// `None` is never collected.
    pub gc_time: Option<Duration>,
}

/// Ensures that gc_time is >= than stale_time.
fn ensure_valid_stale_time(
    stale_time: &Option<Duration>,
    gc_time: &Option<Duration>,
) -> Option<Duration> {
    match (stale_time, gc_time) {
        (Some(stale_time), Some(gc_time)) if stale_time > gc_time => {
            tracing::warn!(
                stale_time_ms = stale_time.as_millis() as u64,
                gc_time_ms = gc_time.as_millis() as u64,
                "stale_time is greater than gc_time, using gc_time instead"
            );
            Some(*gc_time)
        }
        (None, Some(gc_time)) => {
            tracing::warn!(
                gc_time_ms = gc_time.as_millis() as u64,
                "stale_time (infinity) is greater than gc_time, using gc_time instead"
            );
            Some(*gc_time)
        }
        (stale_time, _) => *stale_time,
    }
}

/// `Option<Duration>` as integer milliseconds, `null` for `None`.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
