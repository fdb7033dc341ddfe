use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use slotmap::SlotMap;

use crate::{
    query::{Listener, Query, SubscriberKey},
    query_executor::{self, FetchMode, QueryFuture},
    FetchError, Instant, QueryCache, QueryError, QueryFn, QueryKey, QueryOptions, QueryState,
    QueryStatus, QueryValue, ResolvedQueryOptions, StructuralShare,
};

slotmap::new_key_type! {
    /// Identifies a listener registered with [`QueryObserver::subscribe`].
    pub struct ObserverListenerKey;
}

/// Data shown while a query has none of its own.
///
/// Placeholder data is never written to the cache.
pub enum PlaceholderData<V> {
    /// A fixed value.
    Value(V),
    /// Computed from the data of the key the observer watched before, if any.
    Function(Rc<dyn Fn(Option<&V>) -> Option<V>>),
}

impl<V: Clone> Clone for PlaceholderData<V> {
    fn clone(&self) -> Self {
        match self {
            PlaceholderData::Value(value) => PlaceholderData::Value(value.clone()),
            PlaceholderData::Function(function) => PlaceholderData::Function(function.clone()),
        }
    }
}

/// Options of a [`QueryObserver`].
///
/// `R` is the type the observer exposes, produced from the cached `V` by `select`.
pub struct QueryObserverOptions<V, R = V> {
    /// Staleness, gc time and enabled flag. Unset durations use the defaults of the cache.
    pub options: QueryOptions,
    /// Derives the exposed data from the cached data.
    pub select: Rc<dyn Fn(&V) -> R>,
    /// Shown until the query has data.
    pub placeholder_data: Option<PlaceholderData<V>>,
}

impl<V: Clone + 'static> QueryObserverOptions<V, V> {
    /// Options exposing the cached data as is.
    pub fn new(options: QueryOptions) -> Self {
        Self {
            options,
            select: Rc::new(V::clone),
            placeholder_data: None,
        }
    }
}

impl<V: Clone + 'static> From<QueryOptions> for QueryObserverOptions<V, V> {
    fn from(options: QueryOptions) -> Self {
        Self::new(options)
    }
}

impl<V, R> QueryObserverOptions<V, R> {
    /// Set the query options.
    pub fn set_options(self, options: QueryOptions) -> Self {
        Self { options, ..self }
    }

    /// Set the select transform.
    pub fn set_select<S>(self, select: impl Fn(&V) -> S + 'static) -> QueryObserverOptions<V, S> {
        QueryObserverOptions {
            options: self.options,
            select: Rc::new(select),
            placeholder_data: self.placeholder_data,
        }
    }

    /// Set the placeholder data.
    pub fn set_placeholder_data(self, placeholder_data: PlaceholderData<V>) -> Self {
        Self {
            placeholder_data: Some(placeholder_data),
            ..self
        }
    }
}

impl<V: Clone, R> Clone for QueryObserverOptions<V, R> {
    fn clone(&self) -> Self {
        Self {
            options: self.options,
            select: self.select.clone(),
            placeholder_data: self.placeholder_data.clone(),
        }
    }
}

/// Snapshot of a query as seen by one observer.
pub struct QueryObserverResult<R> {
    /// The selected data, or the selected placeholder.
    pub data: Option<R>,
    /// The last error.
    pub error: Option<FetchError>,
    /// The first fetch is in flight.
    pub is_loading: bool,
    /// Any fetch is in flight.
    pub is_fetching: bool,
    /// The data needs a refetch.
    pub is_stale: bool,
    /// Data (or placeholder data) is present and the last fetch did not fail.
    pub is_success: bool,
    /// The last fetch failed.
    pub is_error: bool,
    /// `data` is placeholder data.
    pub is_placeholder_data: bool,
    /// When the cached data was written.
    pub updated_at: Option<Instant>,
    refetch: Rc<dyn Fn()>,
}

impl<R> QueryObserverResult<R> {
    fn empty(refetch: Rc<dyn Fn()>) -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_fetching: false,
            is_stale: false,
            is_success: false,
            is_error: false,
            is_placeholder_data: false,
            updated_at: None,
            refetch,
        }
    }

    /// Refetches the query in the background. Does nothing when the observer is disabled
    /// or gone.
    pub fn refetch(&self) {
        (self.refetch)()
    }
}

impl<R: Clone> Clone for QueryObserverResult<R> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_loading: self.is_loading,
            is_fetching: self.is_fetching,
            is_stale: self.is_stale,
            is_success: self.is_success,
            is_error: self.is_error,
            is_placeholder_data: self.is_placeholder_data,
            updated_at: self.updated_at,
            refetch: self.refetch.clone(),
        }
    }
}

impl<R: std::fmt::Debug> std::fmt::Debug for QueryObserverResult<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserverResult")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_loading", &self.is_loading)
            .field("is_fetching", &self.is_fetching)
            .field("is_stale", &self.is_stale)
            .field("is_placeholder_data", &self.is_placeholder_data)
            .finish()
    }
}

/// Binds one consumer to one query.
///
/// While alive, the observer keeps its query subscribed (so it is never garbage collected),
/// fetches it when mounted with missing or stale data, and recomputes its
/// [`QueryObserverResult`] on every change. Dropping the observer unsubscribes it.
pub struct QueryObserver<V, R = V>
where
    V: QueryValue,
    R: StructuralShare + 'static,
{
    inner: Rc<ObserverInner<V, R>>,
}

struct ObserverInner<V, R> {
    cache: QueryCache,
    query: RefCell<Query<V>>,
    query_fn: RefCell<QueryFn<V>>,
    options: RefCell<QueryObserverOptions<V, R>>,
    resolved: ResolvedQueryOptions,
    enabled: Rc<Cell<bool>>,
    subscription: Cell<Option<SubscriberKey>>,
    result: RefCell<QueryObserverResult<R>>,
    previous_data: RefCell<Option<V>>,
    listeners: RefCell<SlotMap<ObserverListenerKey, Rc<dyn Fn(&QueryObserverResult<R>)>>>,
    refetch: Rc<dyn Fn()>,
}

impl<V, R> QueryObserver<V, R>
where
    V: QueryValue,
    R: StructuralShare + 'static,
{
    /// Creates an observer of `key` and mounts it.
    pub fn new(
        cache: &QueryCache,
        key: &QueryKey,
        query_fn: QueryFn<V>,
        options: QueryObserverOptions<V, R>,
    ) -> Result<Self, QueryError> {
        let resolved = cache.config().resolve(&options.options);
        let query = cache.get_or_create::<V>(key, resolved.gc_time)?;
        let enabled = Rc::new(Cell::new(options.options.enabled));

        let inner = Rc::new_cyclic(|weak: &Weak<ObserverInner<V, R>>| {
            let weak = weak.clone();
            let refetch: Rc<dyn Fn()> = Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let _ = inner.refetch();
                }
            });
            ObserverInner {
                cache: cache.clone(),
                query: RefCell::new(query),
                query_fn: RefCell::new(query_fn),
                options: RefCell::new(options),
                resolved,
                enabled,
                subscription: Cell::new(None),
                result: RefCell::new(QueryObserverResult::empty(refetch.clone())),
                previous_data: RefCell::new(None),
                listeners: RefCell::new(SlotMap::with_key()),
                refetch,
            }
        });
        inner.mount();
        Ok(QueryObserver { inner })
    }

    /// The observed key.
    pub fn key(&self) -> QueryKey {
        self.inner.query.borrow().key().clone()
    }

    /// The latest snapshot.
    pub fn get_current_result(&self) -> QueryObserverResult<R>
    where
        R: Clone,
    {
        self.inner.result.borrow().clone()
    }

    /// Registers a listener that receives every new snapshot.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult<R>) + 'static,
    ) -> ObserverListenerKey {
        self.inner.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, key: ObserverListenerKey) -> bool {
        self.inner.listeners.borrow_mut().remove(key).is_some()
    }

    /// Starts a new fetch, superseding any fetch in flight.
    ///
    /// Returns `None` without fetching when the observer is disabled.
    pub fn refetch(&self) -> Option<QueryFuture<V>> {
        self.inner.refetch()
    }

    /// Moves the observer to another key.
    ///
    /// The old query loses this subscriber and may start its gc countdown. A
    /// [`PlaceholderData::Function`] receives the data of the old query.
    pub fn set_key(&self, key: &QueryKey, query_fn: QueryFn<V>) -> Result<(), QueryError> {
        let query = self.inner.cache.get_or_create::<V>(key, self.inner.resolved.gc_time)?;

        let previous = self.inner.query.borrow().with_state(|state| state.data().cloned());
        self.inner.unmount();
        if previous.is_some() {
            *self.inner.previous_data.borrow_mut() = previous;
        }

        *self.inner.query.borrow_mut() = query;
        *self.inner.query_fn.borrow_mut() = query_fn;
        self.inner.mount();
        Ok(())
    }

    /// Enables or disables fetching. Enabling fetches stale or missing data.
    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = self.inner.enabled.replace(enabled);
        if enabled && !was_enabled {
            self.inner.fetch_if_stale();
        }
    }

    /// Whether the observer may fetch.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }
}

impl<V, R> Drop for QueryObserver<V, R>
where
    V: QueryValue,
    R: StructuralShare + 'static,
{
    fn drop(&mut self) {
        self.inner.unmount();
    }
}

impl<V, R> ObserverInner<V, R>
where
    V: QueryValue,
    R: StructuralShare + 'static,
{
    fn mount(self: &Rc<Self>) {
        let query = self.query.borrow().clone();
        query.update_gc_time(self.resolved.gc_time);

        let weak = Rc::downgrade(self);
        let listener: Listener<V> = Rc::new(move |state: &QueryState<V>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_state(state);
            }
        });
        let query_fn = self.query_fn.borrow().clone();
        let id = query.subscribe(listener, Some(query_fn), self.enabled.clone());
        self.subscription.set(Some(id));

        self.on_state(&query.get_state());
        self.fetch_if_stale();
    }

    fn unmount(&self) {
        if let Some(id) = self.subscription.take() {
            let query = self.query.borrow().clone();
            query.unsubscribe(id);
        }
    }

    fn fetch_if_stale(&self) {
        if !self.enabled.get() {
            return;
        }
        let query = self.query.borrow().clone();
        if query.is_stale(self.resolved.stale_time) {
            let query_fn = self.query_fn.borrow().clone();
            let _ = query_executor::execute(&query, query_fn, FetchMode::Dedupe);
        }
    }

    fn refetch(&self) -> Option<QueryFuture<V>> {
        let query = self.query.borrow().clone();
        if !self.enabled.get() {
            tracing::debug!(key = %query.key(), "refetch of disabled observer ignored");
            return None;
        }
        let query_fn = self.query_fn.borrow().clone();
        Some(query_executor::execute(&query, query_fn, FetchMode::Replace))
    }

    fn on_state(&self, state: &QueryState<V>) {
        let result = self.compute(state);
        *self.result.borrow_mut() = result.clone();

        let listeners: Vec<Rc<dyn Fn(&QueryObserverResult<R>)>> =
            self.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(&result);
        }
    }

    fn compute(&self, state: &QueryState<V>) -> QueryObserverResult<R> {
        let (select, placeholder) = {
            let options = self.options.borrow();
            (options.select.clone(), options.placeholder_data.clone())
        };

        let (selected, is_placeholder_data) = match state.data() {
            Some(data) => (Some(select(data)), false),
            None => {
                let placeholder = match placeholder {
                    Some(PlaceholderData::Value(value)) => Some(value),
                    Some(PlaceholderData::Function(function)) => {
                        let previous = self.previous_data.borrow().clone();
                        function(previous.as_ref())
                    }
                    None => None,
                };
                match placeholder {
                    Some(placeholder) => (Some(select(&placeholder)), true),
                    None => (None, false),
                }
            }
        };

        // An unchanged selection keeps the allocations of the previous snapshot.
        let data = {
            let previous = self.result.borrow();
            match (previous.data.as_ref(), selected) {
                (Some(previous), Some(next)) => Some(R::replace_equal_deep(previous, next)),
                (_, next) => next,
            }
        };

        let now = self.cache.runtime().now();
        let status = state.status();
        QueryObserverResult {
            data,
            error: state.error.clone(),
            is_loading: state.is_loading(),
            is_fetching: state.is_fetching(),
            is_stale: state.is_stale(self.resolved.stale_time, now),
            is_success: status == QueryStatus::Success
                || (is_placeholder_data && status != QueryStatus::Error),
            is_error: status == QueryStatus::Error,
            is_placeholder_data,
            updated_at: state.updated_at(),
            refetch: self.refetch.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, time::Duration};

    use futures_channel::oneshot;

    use super::*;
    use crate::{
        query_fn, query_key, ManualRuntime, QueryClientConfig, QueryFilter, QueryStatePatch,
    };

    fn setup() -> (ManualRuntime, QueryCache) {
        setup_with(QueryClientConfig::default())
    }

    fn setup_with(config: QueryClientConfig) -> (ManualRuntime, QueryCache) {
        let runtime = ManualRuntime::new();
        let cache = QueryCache::new(config, Rc::new(runtime.clone()));
        (runtime, cache)
    }

    fn counting(value: Vec<u32>) -> (QueryFn<Vec<u32>>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let query_fn = query_fn(move || {
            counter.set(counter.get() + 1);
            let value = value.clone();
            async move { Ok::<_, FetchError>(value) }
        });
        (query_fn, calls)
    }

    #[test]
    fn mount_fetches_missing_data() {
        let (runtime, cache) = setup();
        let (query_fn, calls) = counting(vec![1, 2]);

        let observer = QueryObserver::new(
            &cache,
            &query_key!["numbers"],
            query_fn,
            QueryObserverOptions::new(QueryOptions::default()),
        )
        .unwrap();
        assert_eq!(calls.get(), 1);
        let result = observer.get_current_result();
        assert!(result.is_loading);
        assert!(!result.is_success);

        runtime.run_until_stalled();
        let result = observer.get_current_result();
        assert_eq!(result.data, Some(vec![1, 2]));
        assert!(result.is_success);
        assert!(!result.is_fetching);
    }

    #[test]
    fn fresh_data_is_not_refetched_on_mount() {
        let (_, cache) = setup();
        let key = query_key!["numbers"];
        cache.set(&key, QueryStatePatch::success(vec![1_u32])).unwrap();
        let (query_fn, calls) = counting(vec![2]);

        let options = QueryOptions::default().set_stale_time(Some(Duration::from_secs(60)));
        let observer =
            QueryObserver::new(&cache, &key, query_fn, QueryObserverOptions::new(options)).unwrap();

        assert_eq!(calls.get(), 0);
        let result = observer.get_current_result();
        assert_eq!(result.data, Some(vec![1]));
        assert!(!result.is_stale);
    }

    #[test]
    fn default_options_use_the_stale_time_of_the_cache() {
        let (runtime, cache) =
            setup_with(QueryClientConfig::default().set_stale_time(Some(Duration::from_secs(60))));
        let key = query_key!["numbers"];
        cache.set(&key, QueryStatePatch::success(vec![1_u32])).unwrap();
        runtime.advance(Duration::from_secs(1));
        let (query_fn, calls) = counting(vec![2]);

        let options = QueryObserverOptions::new(QueryOptions::default());
        let observer = QueryObserver::new(&cache, &key, query_fn, options).unwrap();

        assert_eq!(calls.get(), 0);
        let result = observer.get_current_result();
        assert!(!result.is_stale);
        assert!(!result.is_fetching);
    }

    #[test]
    fn default_options_use_the_gc_time_of_the_cache() {
        let (runtime, cache) =
            setup_with(QueryClientConfig::default().set_gc_time(Some(Duration::from_secs(1))));
        let key = query_key!["numbers"];
        let (query_fn, _) = counting(vec![1]);

        let options = QueryObserverOptions::new(QueryOptions::default());
        let observer = QueryObserver::new(&cache, &key, query_fn, options).unwrap();
        runtime.run_until_stalled();
        drop(observer);

        runtime.advance(Duration::from_secs(2));
        assert!(!cache.contains(&key));
    }

    #[test]
    fn stale_data_is_shown_while_revalidating() {
        let (runtime, cache) = setup();
        let key = query_key!["numbers"];
        cache.set(&key, QueryStatePatch::success(vec![1_u32])).unwrap();
        runtime.advance(Duration::from_millis(1));
        let (query_fn, calls) = counting(vec![2]);

        let observer = QueryObserver::new(
            &cache,
            &key,
            query_fn,
            QueryObserverOptions::new(QueryOptions::default()),
        )
        .unwrap();
        assert_eq!(calls.get(), 1);
        let result = observer.get_current_result();
        assert_eq!(result.data, Some(vec![1]));
        assert!(result.is_stale);
        assert!(result.is_fetching);
        assert!(!result.is_loading);

        runtime.run_until_stalled();
        assert_eq!(observer.get_current_result().data, Some(vec![2]));
    }

    #[test]
    fn select_keeps_unchanged_selection() {
        let (runtime, cache) = setup();
        let key = query_key!["numbers"];
        let (query_fn, _) = counting(vec![1, 2, 3]);

        let options = QueryObserverOptions::new(QueryOptions::default())
            .set_select(|numbers: &Vec<u32>| Rc::new(numbers.iter().sum::<u32>()));
        let observer = QueryObserver::new(&cache, &key, query_fn, options).unwrap();
        runtime.run_until_stalled();
        let first = observer.get_current_result().data.unwrap();
        assert_eq!(*first, 6);

        // Different data, same selection.
        cache.set(&key, QueryStatePatch::success(vec![6_u32])).unwrap();
        let second = observer.get_current_result().data.unwrap();
        assert!(Rc::ptr_eq(&first, &second));

        cache.set(&key, QueryStatePatch::success(vec![7_u32])).unwrap();
        assert_eq!(*observer.get_current_result().data.unwrap(), 7);
    }

    #[test]
    fn placeholder_is_never_cached() {
        let (runtime, cache) = setup();
        let key = query_key!["numbers"];
        let (sender, receiver) = oneshot::channel::<Vec<u32>>();
        let receiver = Rc::new(RefCell::new(Some(receiver)));
        let query_fn = query_fn(move || {
            let receiver = receiver.borrow_mut().take();
            async move {
                match receiver {
                    Some(receiver) => receiver.await.map_err(|_| FetchError::network("dropped")),
                    None => Err(FetchError::network("called twice")),
                }
            }
        });

        let options = QueryObserverOptions::new(QueryOptions::default())
            .set_placeholder_data(PlaceholderData::Value(vec![0]));
        let observer = QueryObserver::new(&cache, &key, query_fn, options).unwrap();

        let result = observer.get_current_result();
        assert_eq!(result.data, Some(vec![0]));
        assert!(result.is_placeholder_data);
        assert!(result.is_success);
        assert!(cache.get::<Vec<u32>>(&key).unwrap().unwrap().data().is_none());

        sender.send(vec![5]).unwrap();
        runtime.run_until_stalled();
        let result = observer.get_current_result();
        assert_eq!(result.data, Some(vec![5]));
        assert!(!result.is_placeholder_data);
    }

    #[test]
    fn disabled_observer_never_fetches() {
        let (runtime, cache) = setup();
        let key = query_key!["numbers"];
        let (query_fn, calls) = counting(vec![1]);

        let options = QueryObserverOptions::new(QueryOptions::default().set_enabled(false));
        let observer = QueryObserver::new(&cache, &key, query_fn, options).unwrap();
        assert!(observer.refetch().is_none());
        cache.invalidate_queries(&QueryFilter::all());
        runtime.run_until_stalled();
        assert_eq!(calls.get(), 0);

        observer.set_enabled(true);
        runtime.run_until_stalled();
        assert_eq!(calls.get(), 1);
        assert_eq!(observer.get_current_result().data, Some(vec![1]));
    }

    #[test]
    fn set_key_passes_previous_data_to_placeholder() {
        let (runtime, cache) = setup();
        let (first_fn, _) = counting(vec![1]);
        let (second_fn, _) = counting(vec![2]);

        let options = QueryObserverOptions::new(QueryOptions::default()).set_placeholder_data(
            PlaceholderData::Function(Rc::new(|previous: Option<&Vec<u32>>| previous.cloned())),
        );
        let observer =
            QueryObserver::new(&cache, &query_key!["page", 1], first_fn, options).unwrap();
        runtime.run_until_stalled();

        observer.set_key(&query_key!["page", 2], second_fn).unwrap();
        let result = observer.get_current_result();
        assert_eq!(observer.key(), query_key!["page", 2]);
        assert_eq!(result.data, Some(vec![1]));
        assert!(result.is_placeholder_data);
        assert_eq!(cache.get_stats().active_listeners, 1);

        runtime.run_until_stalled();
        let result = observer.get_current_result();
        assert_eq!(result.data, Some(vec![2]));
        assert!(!result.is_placeholder_data);
    }

    #[test]
    fn listeners_receive_snapshots_and_drop_unsubscribes() {
        let (runtime, cache) = setup();
        let key = query_key!["numbers"];
        let (query_fn, _) = counting(vec![3]);

        let observer = QueryObserver::new(
            &cache,
            &key,
            query_fn,
            QueryObserverOptions::new(QueryOptions::default()),
        )
        .unwrap();
        let fetching = Rc::new(RefCell::new(Vec::new()));
        let seen = fetching.clone();
        observer.subscribe(move |result| seen.borrow_mut().push(result.is_fetching));

        runtime.run_until_stalled();
        assert_eq!(*fetching.borrow(), vec![false]);
        assert_eq!(cache.get_stats().active_listeners, 1);

        drop(observer);
        assert_eq!(cache.get_stats().active_listeners, 0);
        assert_eq!(runtime.pending_timers(), 1);
    }
}
