use crate::QueryKey;

/// Subscribing to cache events
pub trait CacheObserver {
    /// receive a cache event.
    fn process_cache_event(&self, event: CacheEvent);
}

impl<F> CacheObserver for F
where
    F: Fn(CacheEvent),
{
    fn process_cache_event(&self, event: CacheEvent) {
        self(event)
    }
}

/// The events that can be observed from the query cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A query was added to the cache.
    Added(QueryKey),
    /// The state of a query changed.
    Updated(QueryKey),
    /// A query was removed from the cache.
    Removed {
        /// Key of the removed query.
        key: QueryKey,
        /// Why it was removed.
        reason: RemovalReason,
    },
    /// A query gained a subscriber.
    ObserverAdded(QueryKey),
    /// A query lost a subscriber.
    ObserverRemoved(QueryKey),
}

impl CacheEvent {
    /// The key of the query this event is about.
    pub fn key(&self) -> &QueryKey {
        match self {
            CacheEvent::Added(key)
            | CacheEvent::Updated(key)
            | CacheEvent::ObserverAdded(key)
            | CacheEvent::ObserverRemoved(key) => key,
            CacheEvent::Removed { key, .. } => key,
        }
    }
}

/// Why a query left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Its gc time elapsed with no subscribers.
    GarbageCollected,
    /// The cache was over its size ceiling and this was the least recently used idle entry.
    Evicted,
    /// Removed through [`QueryClient::remove_queries`](crate::QueryClient::remove_queries).
    Removed,
    /// Removed through [`QueryClient::clear`](crate::QueryClient::clear).
    Cleared,
}
