use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};

use slotmap::SlotMap;

use crate::{
    cache_observer::CacheEvent,
    garbage_collector::GarbageCollector,
    hydration::DehydratedQuery,
    query_cache::{CacheInner, QueryCache, QueryInfo},
    query_executor::{self, FetchMode, InFlight, QueryFuture},
    FetchStatus, Instant, QueryError, QueryFn, QueryKey, QueryRuntime, QueryState,
    QueryStatePatch, QueryValue,
};

slotmap::new_key_type! {
    /// Identifies one subscriber of a query.
    pub struct SubscriberKey;
}

pub(crate) type Listener<V> = Rc<dyn Fn(&QueryState<V>)>;

pub(crate) struct Subscriber<V> {
    pub(crate) listener: Listener<V>,
    /// Used to refetch on invalidation. Plain listeners have none.
    pub(crate) query_fn: Option<QueryFn<V>>,
    pub(crate) enabled: Rc<Cell<bool>>,
}

/// One cache entry: the state of a key plus everything that changes it.
pub(crate) struct Query<V> {
    inner: Rc<QueryInner<V>>,
}

pub(crate) struct WeakQuery<V>(Weak<QueryInner<V>>);

struct QueryInner<V> {
    key: QueryKey,

    // State
    state: RefCell<QueryState<V>>,

    // Execution
    in_flight: RefCell<Option<InFlight<V>>>,
    generation: Cell<u64>,

    // Synchronization
    subscribers: RefCell<SlotMap<SubscriberKey, Subscriber<V>>>,
    garbage_collector: GarbageCollector,
    cache: Weak<CacheInner>,
    runtime: Rc<dyn QueryRuntime>,
    disposed: Cell<bool>,
}

impl<V> Clone for Query<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> PartialEq for Query<V> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<V> WeakQuery<V> {
    pub(crate) fn upgrade(&self) -> Option<Query<V>> {
        self.0.upgrade().map(|inner| Query { inner })
    }
}

impl<V> Query<V>
where
    V: QueryValue,
{
    pub(crate) fn new(
        key: QueryKey,
        cache: Weak<CacheInner>,
        runtime: Rc<dyn QueryRuntime>,
        gc_time: Option<Duration>,
    ) -> Self {
        let garbage_collector =
            GarbageCollector::new(key.clone(), cache.clone(), runtime.clone(), gc_time);
        Query {
            inner: Rc::new(QueryInner {
                key,
                state: RefCell::new(QueryState::default()),
                in_flight: RefCell::new(None),
                generation: Cell::new(0),
                subscribers: RefCell::new(SlotMap::with_key()),
                garbage_collector,
                cache,
                runtime,
                disposed: Cell::new(false),
            }),
        }
    }

    pub(crate) fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    pub(crate) fn runtime(&self) -> &Rc<dyn QueryRuntime> {
        &self.inner.runtime
    }

    pub(crate) fn downgrade(&self) -> WeakQuery<V> {
        WeakQuery(Rc::downgrade(&self.inner))
    }

    fn cache(&self) -> Option<QueryCache> {
        if self.inner.disposed.get() {
            return None;
        }
        self.inner.cache.upgrade().map(QueryCache::from_inner)
    }

    /**
     * State.
     */

    pub(crate) fn get_state(&self) -> QueryState<V> {
        self.inner.state.borrow().clone()
    }

    // Useful to avoid clones.
    pub(crate) fn with_state<T>(&self, func: impl FnOnce(&QueryState<V>) -> T) -> T {
        func(&self.inner.state.borrow())
    }

    /// Applies `update` and notifies every subscriber with the result.
    pub(crate) fn update_state(&self, update: impl FnOnce(&mut QueryState<V>, Instant)) {
        let now = self.inner.runtime.now();
        let snapshot = {
            let mut state = self.inner.state.borrow_mut();
            update(&mut state, now);
            state.clone()
        };
        self.notify(&snapshot);
    }

    pub(crate) fn set_state(&self, patch: QueryStatePatch<V>) {
        self.update_state(move |state, now| patch.apply(state, now));
    }

    // Listeners may call back into the query, so no borrow is held while they run.
    fn notify(&self, state: &QueryState<V>) {
        let listeners: Vec<Listener<V>> = self
            .inner
            .subscribers
            .borrow()
            .values()
            .map(|subscriber| subscriber.listener.clone())
            .collect();

        for listener in listeners {
            listener(state);
        }

        if let Some(cache) = self.cache() {
            cache.touch(self.key());
            cache.notify(CacheEvent::Updated(self.key().clone()));
        }
    }

    /// Marks the data as stale regardless of its age.
    pub(crate) fn mark_invalid(&self) {
        self.update_state(|state, _| state.is_invalidated = true);
    }

    /// Marks the data invalid and refetches it if an enabled subscriber can.
    pub(crate) fn invalidate(&self) {
        self.mark_invalid();
        if let Some(query_fn) = self.active_query_fn() {
            let _ = query_executor::execute(self, query_fn, FetchMode::Replace);
        }
    }

    pub(crate) fn is_stale(&self, stale_time: Option<Duration>) -> bool {
        let now = self.inner.runtime.now();
        self.with_state(|state| state.is_stale(stale_time, now))
    }

    /// The data, if present and fresh.
    pub(crate) fn fresh_data(&self, stale_time: Option<Duration>) -> Option<V> {
        let now = self.inner.runtime.now();
        self.with_state(|state| {
            if state.is_stale(stale_time, now) {
                None
            } else {
                state.data().cloned()
            }
        })
    }

    /**
     * Subscriptions.
     */

    pub(crate) fn subscribe(
        &self,
        listener: Listener<V>,
        query_fn: Option<QueryFn<V>>,
        enabled: Rc<Cell<bool>>,
    ) -> SubscriberKey {
        let id = self.inner.subscribers.borrow_mut().insert(Subscriber {
            listener,
            query_fn,
            enabled,
        });
        self.inner.garbage_collector.disable_gc();

        if let Some(cache) = self.cache() {
            cache.touch(self.key());
            cache.notify(CacheEvent::ObserverAdded(self.key().clone()));
        }
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriberKey) -> bool {
        let (removed, idle) = {
            let mut subscribers = self.inner.subscribers.borrow_mut();
            let removed = subscribers.remove(id);
            (removed, subscribers.is_empty())
        };
        if removed.is_none() {
            return false;
        }

        if let Some(cache) = self.cache() {
            cache.notify(CacheEvent::ObserverRemoved(self.key().clone()));
            if idle {
                self.inner.garbage_collector.enable_gc();
                cache.enforce_ceiling(None);
            }
        }
        true
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// The query function of the first enabled subscriber that has one.
    pub(crate) fn active_query_fn(&self) -> Option<QueryFn<V>> {
        self.inner
            .subscribers
            .borrow()
            .values()
            .find(|subscriber| subscriber.enabled.get() && subscriber.query_fn.is_some())
            .and_then(|subscriber| subscriber.query_fn.clone())
    }

    /**
     * Garbage collection.
     */

    pub(crate) fn update_gc_time(&self, gc_time: Option<Duration>) {
        self.inner.garbage_collector.update_gc_time(gc_time);
    }

    pub(crate) fn enable_gc(&self) {
        if self.subscriber_count() == 0 && !self.inner.disposed.get() {
            self.inner.garbage_collector.enable_gc();
        }
    }

    pub(crate) fn gc_active(&self) -> bool {
        self.inner.garbage_collector.is_active()
    }

    /// Detaches the query from the cache. Its GC timer is cleared and it no longer reports
    /// cache events. A fetch in flight still settles into the detached state.
    pub(crate) fn dispose(&self) {
        self.inner.disposed.set(true);
        self.inner.garbage_collector.disable_gc();
    }

    /**
     * Execution and Cancellation.
     */

    pub(crate) fn in_flight_future(&self) -> Option<QueryFuture<V>> {
        self.inner
            .in_flight
            .borrow()
            .as_ref()
            .map(|in_flight| in_flight.future.clone())
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.inner.in_flight.borrow().is_some()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.get()
    }

    pub(crate) fn next_generation(&self) -> u64 {
        let generation = self.inner.generation.get() + 1;
        self.inner.generation.set(generation);
        generation
    }

    /// Replaces the in-flight record. A replaced fetch keeps running, its result is discarded.
    pub(crate) fn install_in_flight(&self, in_flight: InFlight<V>) {
        let previous = self.inner.in_flight.borrow_mut().replace(in_flight);
        drop(previous);
    }

    /// Removes the in-flight record if it still belongs to `generation`.
    pub(crate) fn finish_in_flight(&self, generation: u64) {
        let mut in_flight = self.inner.in_flight.borrow_mut();
        if in_flight.as_ref().map(|f| f.generation) == Some(generation) {
            *in_flight = None;
        }
    }

    /// Aborts the fetch in flight. Returns whether there was one.
    ///
    /// Callers awaiting the fetch resolve with a [`FetchError::CANCELLED`](crate::FetchError::CANCELLED)
    /// error. The state keeps its data and error and goes back to idle.
    pub(crate) fn cancel(&self) -> bool {
        let in_flight = self.inner.in_flight.borrow_mut().take();
        let Some(mut in_flight) = in_flight else {
            return false;
        };

        // Whatever the aborted fetch resolves with is stale now.
        self.next_generation();
        if let Some(cancel) = in_flight.cancel.take() {
            if cancel.send(()).is_err() {
                tracing::debug!(key = %self.key(), "fetch finished before it could be cancelled");
            }
        }
        tracing::debug!(key = %self.key(), "fetch cancelled");
        self.update_state(|state, _| state.fetch_status = FetchStatus::Idle);
        true
    }

    /// Drops the data and error and aborts the fetch in flight, keeping every subscriber.
    /// Refetches right away when an enabled subscriber can.
    pub(crate) fn reset(&self) {
        let in_flight = self.inner.in_flight.borrow_mut().take();
        self.next_generation();
        if let Some(cancel) = in_flight.and_then(|mut in_flight| in_flight.cancel.take()) {
            let _ = cancel.send(());
        }
        tracing::debug!(key = %self.key(), "query reset");
        self.update_state(|state, _| *state = QueryState::default());

        if let Some(query_fn) = self.active_query_fn() {
            let _ = query_executor::execute(self, query_fn, FetchMode::Replace);
        }
    }

    /**
     * Introspection.
     */

    pub(crate) fn info(&self) -> QueryInfo {
        let observer_count = self.subscriber_count();
        self.with_state(|state| QueryInfo {
            key: self.key().clone(),
            has_data: state.data.is_some(),
            has_error: state.error.is_some(),
            is_fetching: state.is_fetching(),
            is_invalidated: state.is_invalidated,
            updated_at: state.updated_at(),
            observer_count,
        })
    }

    pub(crate) fn dehydrate(&self) -> Result<Option<DehydratedQuery>, QueryError> {
        self.with_state(|state| match &state.data {
            Some(data) => Ok(Some(DehydratedQuery {
                key: self.key().clone(),
                data: serde_json::to_value(&data.data)?,
                updated_at: data.updated_at.as_millis(),
            })),
            None => Ok(None),
        })
    }
}
