use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use slotmap::SlotMap;

use crate::{
    cache_observer::{CacheEvent, CacheObserver, RemovalReason},
    hydration::DehydratedQuery,
    query::{Query, SubscriberKey},
    Instant, QueryClientConfig, QueryError, QueryFilter, QueryKey, QueryRuntime, QueryState,
    QueryStatePatch, QueryValue,
};

/// The bounded store of every query, keyed by normalized key.
///
/// Entries hold values of different types. Asking for an entry with a type other than the one
/// it was created with fails with [`QueryError::TypeMismatch`].
///
/// When more than [`max_queries`](QueryClientConfig::max_queries) entries exist, the least
/// recently used entry without subscribers is evicted. If every entry has subscribers, the
/// store grows past the ceiling and shrinks back as soon as entries lose their last subscriber.
#[derive(Clone)]
pub struct QueryCache {
    inner: Rc<CacheInner>,
}

pub(crate) struct CacheInner {
    entries: RefCell<HashMap<Rc<str>, CacheSlot>>,
    access_clock: Cell<u64>,
    config: QueryClientConfig,
    runtime: Rc<dyn QueryRuntime>,
    observers: RefCell<SlotMap<CacheObserverKey, Rc<dyn CacheObserver>>>,
}

struct CacheSlot {
    entry: Rc<dyn CacheEntryTrait>,
    last_access: Cell<u64>,
}

slotmap::new_key_type! {
    /// Identifies a registered [`CacheObserver`].
    pub struct CacheObserverKey;
}

/// A row of [`QueryCache::get_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryInfo {
    /// Key of the query.
    pub key: QueryKey,
    /// Whether the query holds data.
    pub has_data: bool,
    /// Whether the last fetch failed.
    pub has_error: bool,
    /// Whether a fetch is in flight.
    pub is_fetching: bool,
    /// Whether the query was invalidated since its last success.
    pub is_invalidated: bool,
    /// When the data was last written.
    pub updated_at: Option<Instant>,
    /// Number of subscribers.
    pub observer_count: usize,
}

/// Introspection counters, see [`QueryCache::get_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in the store.
    pub cache_size: usize,
    /// The configured ceiling.
    pub max_size: usize,
    /// Entries with at least one subscriber.
    pub active_subscribers: usize,
    /// Subscriber handles across all entries.
    pub active_listeners: usize,
    /// Entries whose gc countdown is running.
    pub active_gc_timers: usize,
    /// Entries with a fetch in flight.
    pub in_flight_fetches: usize,
}

// Trait to enable cache introspection among entries of distinct value types.
pub(crate) trait CacheEntryTrait {
    fn as_any(&self) -> &dyn Any;
    fn key(&self) -> &QueryKey;
    fn observer_count(&self) -> usize;
    fn unsubscribe(&self, id: SubscriberKey) -> bool;
    fn invalidate(&self);
    fn cancel(&self) -> bool;
    fn reset(&self);
    fn info(&self) -> QueryInfo;
    fn dehydrate(&self) -> Result<Option<DehydratedQuery>, QueryError>;
    fn dispose(&self);
    fn gc_active(&self) -> bool;
    fn is_fetching(&self) -> bool;
}

impl<V> CacheEntryTrait for Query<V>
where
    V: QueryValue,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn key(&self) -> &QueryKey {
        Query::key(self)
    }

    fn observer_count(&self) -> usize {
        self.subscriber_count()
    }

    fn unsubscribe(&self, id: SubscriberKey) -> bool {
        Query::unsubscribe(self, id)
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn cancel(&self) -> bool {
        Query::cancel(self)
    }

    fn reset(&self) {
        Query::reset(self)
    }

    fn info(&self) -> QueryInfo {
        Query::info(self)
    }

    fn dehydrate(&self) -> Result<Option<DehydratedQuery>, QueryError> {
        Query::dehydrate(self)
    }

    fn dispose(&self) {
        Query::dispose(self)
    }

    fn gc_active(&self) -> bool {
        Query::gc_active(self)
    }

    fn is_fetching(&self) -> bool {
        Query::is_fetching(self)
    }
}

impl QueryCache {
    /// Creates an empty cache.
    pub fn new(config: QueryClientConfig, runtime: Rc<dyn QueryRuntime>) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                entries: RefCell::new(HashMap::new()),
                access_clock: Cell::new(0),
                config,
                runtime,
                observers: RefCell::new(SlotMap::with_key()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<CacheInner>) -> Self {
        Self { inner }
    }

    /// The configuration the cache was created with.
    pub fn config(&self) -> &QueryClientConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Rc<dyn QueryRuntime> {
        &self.inner.runtime
    }

    /// Current state of a query.
    pub fn get<V>(&self, key: &QueryKey) -> Result<Option<QueryState<V>>, QueryError>
    where
        V: QueryValue,
    {
        Ok(self.get_query::<V>(key)?.map(|query| query.get_state()))
    }

    /// Merges `patch` into the state of a query, creating it if needed, and notifies its
    /// subscribers.
    pub fn set<V>(&self, key: &QueryKey, patch: QueryStatePatch<V>) -> Result<(), QueryError>
    where
        V: QueryValue,
    {
        let query = self.get_or_create::<V>(key, self.inner.config.gc_time)?;
        query.set_state(patch);
        Ok(())
    }

    /// Registers a listener for a query, creating it if needed.
    ///
    /// The listener runs on every state change. While it is registered the query is never
    /// garbage collected.
    pub fn subscribe<V>(
        &self,
        key: &QueryKey,
        listener: impl Fn(&QueryState<V>) + 'static,
    ) -> Result<SubscriberKey, QueryError>
    where
        V: QueryValue,
    {
        let query = self.get_or_create::<V>(key, self.inner.config.gc_time)?;
        Ok(query.subscribe(Rc::new(listener), None, Rc::new(Cell::new(true))))
    }

    /// Removes a listener. Once a query has no listeners left its gc countdown starts.
    pub fn unsubscribe(&self, key: &QueryKey, id: SubscriberKey) -> bool {
        match self.entry(key.hash()) {
            Some(entry) => entry.unsubscribe(id),
            None => false,
        }
    }

    /// Introspection rows for every entry, sorted by key.
    pub fn get_all(&self) -> Vec<QueryInfo> {
        let mut rows: Vec<QueryInfo> = self.entries().iter().map(|entry| entry.info()).collect();
        rows.sort_by(|a, b| a.key.hash().cmp(b.key.hash()));
        rows
    }

    /// Introspection counters.
    pub fn get_stats(&self) -> CacheStats {
        let entries = self.entries();
        let mut stats = CacheStats {
            cache_size: entries.len(),
            max_size: self.inner.config.max_queries,
            active_subscribers: 0,
            active_listeners: 0,
            active_gc_timers: 0,
            in_flight_fetches: 0,
        };
        for entry in entries {
            let observers = entry.observer_count();
            stats.active_listeners += observers;
            stats.active_subscribers += usize::from(observers > 0);
            stats.active_gc_timers += usize::from(entry.gc_active());
            stats.in_flight_fetches += usize::from(entry.is_fetching());
        }
        stats
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    /// Whether an entry exists for `key`.
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.borrow().contains_key(key.hash())
    }

    /// Registers an observer of cache-wide events.
    pub fn register_observer(&self, observer: impl CacheObserver + 'static) -> CacheObserverKey {
        self.inner.observers.borrow_mut().insert(Rc::new(observer))
    }

    /// Removes an observer registered with [`register_observer`](Self::register_observer).
    pub fn unregister_observer(&self, key: CacheObserverKey) -> bool {
        self.inner.observers.borrow_mut().remove(key).is_some()
    }

    /**
     * Entry management.
     */

    pub(crate) fn get_or_create<V>(
        &self,
        key: &QueryKey,
        gc_time: Option<std::time::Duration>,
    ) -> Result<Query<V>, QueryError>
    where
        V: QueryValue,
    {
        if let Some(entry) = self.entry(key.hash()) {
            self.touch(key);
            return downcast::<V>(&entry);
        }

        let query = Query::<V>::new(
            key.clone(),
            Rc::downgrade(&self.inner),
            self.inner.runtime.clone(),
            gc_time,
        );
        let slot = CacheSlot {
            entry: Rc::new(query.clone()),
            last_access: Cell::new(self.next_tick()),
        };
        self.inner
            .entries
            .borrow_mut()
            .insert(key.hash().into(), slot);

        tracing::debug!(key = %key, "query added");
        self.notify(CacheEvent::Added(key.clone()));
        self.enforce_ceiling(Some(key));

        // Nobody is subscribed yet, start counting down until someone is.
        query.enable_gc();
        Ok(query)
    }

    pub(crate) fn get_query<V>(&self, key: &QueryKey) -> Result<Option<Query<V>>, QueryError>
    where
        V: QueryValue,
    {
        match self.entry(key.hash()) {
            Some(entry) => {
                self.touch(key);
                downcast::<V>(&entry).map(Some)
            }
            None => Ok(None),
        }
    }

    fn entry(&self, hash: &str) -> Option<Rc<dyn CacheEntryTrait>> {
        self.inner
            .entries
            .borrow()
            .get(hash)
            .map(|slot| slot.entry.clone())
    }

    // Cloned out so that no borrow is held while calling into queries.
    fn entries(&self) -> Vec<Rc<dyn CacheEntryTrait>> {
        self.inner
            .entries
            .borrow()
            .values()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    pub(crate) fn find_matching(&self, filter: &QueryFilter) -> Vec<Rc<dyn CacheEntryTrait>> {
        self.entries()
            .into_iter()
            .filter(|entry| filter.matches(entry.key()))
            .collect()
    }

    fn next_tick(&self) -> u64 {
        let tick = self.inner.access_clock.get() + 1;
        self.inner.access_clock.set(tick);
        tick
    }

    /// Marks `key` as most recently used.
    pub(crate) fn touch(&self, key: &QueryKey) {
        let tick = self.next_tick();
        if let Some(slot) = self.inner.entries.borrow().get(key.hash()) {
            slot.last_access.set(tick);
        }
    }

    /// Evicts least recently used idle entries until the cache fits its ceiling.
    /// `protect` is never chosen as a victim.
    pub(crate) fn enforce_ceiling(&self, protect: Option<&QueryKey>) {
        let max_queries = self.inner.config.max_queries;
        loop {
            let (size, victim) = {
                let entries = self.inner.entries.borrow();
                if entries.len() <= max_queries {
                    return;
                }
                let victim = entries
                    .iter()
                    .filter(|(hash, slot)| {
                        protect.map_or(true, |key| key.hash() != &***hash)
                            && slot.entry.observer_count() == 0
                    })
                    .min_by_key(|(_, slot)| slot.last_access.get())
                    .map(|(hash, _)| hash.clone());
                (entries.len(), victim)
            };

            match victim {
                Some(hash) => {
                    tracing::debug!(key = %hash, size, max_queries, "evicting least recently used query");
                    self.remove_entry(&hash, RemovalReason::Evicted);
                }
                None => {
                    tracing::warn!(
                        size,
                        max_queries,
                        "query cache is over capacity but every query is in use"
                    );
                    return;
                }
            }
        }
    }

    /// Called when a gc countdown elapses.
    pub(crate) fn collect_garbage(&self, key: &QueryKey) {
        let idle = self
            .entry(key.hash())
            .map_or(false, |entry| entry.observer_count() == 0);
        if idle {
            tracing::debug!(key = %key, "garbage collecting query");
            self.remove_entry(key.hash(), RemovalReason::GarbageCollected);
        }
    }

    pub(crate) fn remove_entry(&self, hash: &str, reason: RemovalReason) -> bool {
        let removed = self.inner.entries.borrow_mut().remove(hash);
        match removed {
            Some(slot) => {
                slot.entry.dispose();
                self.notify(CacheEvent::Removed {
                    key: slot.entry.key().clone(),
                    reason,
                });
                true
            }
            None => false,
        }
    }

    /// Marks matching entries invalid and refetches the ones with enabled subscribers.
    pub(crate) fn invalidate_queries(&self, filter: &QueryFilter) -> usize {
        let matching = self.find_matching(filter);
        for entry in &matching {
            tracing::debug!(key = %entry.key(), "invalidating query");
            entry.invalidate();
        }
        matching.len()
    }

    pub(crate) fn cancel_query(&self, key: &QueryKey) -> bool {
        self.entry(key.hash()).map_or(false, |entry| entry.cancel())
    }

    /// Removes matching entries. An entry that still has subscribers stays in the cache
    /// with its state reset, so those subscribers keep sharing it with the cache.
    pub(crate) fn remove_queries(&self, filter: &QueryFilter, reason: RemovalReason) -> usize {
        let mut removed = 0;
        for entry in self.find_matching(filter) {
            if entry.observer_count() > 0 {
                tracing::debug!(key = %entry.key(), "query in use, resetting instead of removing");
                entry.reset();
                removed += 1;
            } else if self.remove_entry(entry.key().hash(), reason) {
                removed += 1;
            }
        }
        removed
    }

    pub(crate) fn notify(&self, event: CacheEvent) {
        let observers: Vec<Rc<dyn CacheObserver>> =
            self.inner.observers.borrow().values().cloned().collect();
        for observer in observers {
            observer.process_cache_event(event.clone());
        }
    }
}

fn downcast<V>(entry: &Rc<dyn CacheEntryTrait>) -> Result<Query<V>, QueryError>
where
    V: QueryValue,
{
    entry
        .as_any()
        .downcast_ref::<Query<V>>()
        .cloned()
        .ok_or_else(|| QueryError::TypeMismatch {
            key: entry.key().hash().to_string(),
        })
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("size", &self.size())
            .field("config", &self.inner.config)
            .finish()
    }
}
