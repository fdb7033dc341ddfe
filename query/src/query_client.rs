use std::rc::Rc;

use crate::{
    cache_observer::{CacheObserver, RemovalReason},
    mutation::{Mutation, MutationOptions},
    query::SubscriberKey,
    query_cache::CacheObserverKey,
    query_executor::{self, FetchMode},
    query_observer::{QueryObserver, QueryObserverOptions},
    DehydratedState, QueryCache, QueryClientConfig, QueryError, QueryFilter, QueryFn, QueryKey,
    QueryOptions, QueryRuntime, QueryState, QueryStatePatch, QueryValue, StructuralShare,
};

/// The entry point of the library. Owns a [`QueryCache`] and exposes utility functions to
/// manage queries.
///
/// Queries can be:
/// - [Fetched](Self::fetch_query) or [prefetched](Self::prefetch_query)
///     - Concurrent requests for one key share a single fetch.
/// - [Invalidated](Self::invalidate_queries)
///     - Matching queries are marked stale. Observed ones are refetched in the background.
/// - [Introspected](Self::get_query_state)
///     - Lets you see the current state of a query without subscribing to it.
/// - [Manually updated](Self::set_query_data)
///     - Useful when you have updated a value and want to put it in the cache instead of
///       waiting for the query to refetch.
///
/// Clones share the same cache.
///
/// ```
/// use std::rc::Rc;
/// use query_core::{query_fn, query_key, FetchError, ManualRuntime, QueryClient, QueryClientConfig};
///
/// let runtime = ManualRuntime::new();
/// let client = QueryClient::new(QueryClientConfig::default(), Rc::new(runtime.clone()));
///
/// let fetch_count = query_fn(|| async { Ok::<_, FetchError>(3_u32) });
/// let count = runtime.block_on(client.fetch_query(&query_key!["count"], fetch_count));
/// assert_eq!(count, Ok(3));
/// assert_eq!(client.get_query_data::<u32>(&query_key!["count"]), Ok(Some(3)));
/// ```
#[derive(Clone, Debug)]
pub struct QueryClient {
    cache: QueryCache,
}

/// A subscription created by [`QueryClient::subscribe`]. Unsubscribes when dropped.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    cache: QueryCache,
    key: QueryKey,
    id: Option<SubscriberKey>,
}

impl Subscription {
    /// The subscribed key.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Unsubscribes now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.cache.unsubscribe(&self.key, id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

impl QueryClient {
    /// Creates a client with its own cache.
    pub fn new(config: QueryClientConfig, runtime: Rc<dyn QueryRuntime>) -> Self {
        Self {
            cache: QueryCache::new(config, runtime),
        }
    }

    /// The underlying cache.
    pub fn get_query_cache(&self) -> &QueryCache {
        &self.cache
    }

    /// The client configuration.
    pub fn config(&self) -> &QueryClientConfig {
        self.cache.config()
    }

    /// Query options that use the client defaults.
    pub fn default_options(&self) -> QueryOptions {
        self.config().query_options()
    }

    /// Fetch a query and store it in cache.
    ///
    /// Fresh cached data is returned without fetching. Otherwise a fetch is started, or the
    /// one in flight for this key is joined.
    ///
    /// If you don't need the result opt for [`prefetch_query()`](Self::prefetch_query).
    pub async fn fetch_query<V>(&self, key: &QueryKey, query_fn: QueryFn<V>) -> Result<V, QueryError>
    where
        V: QueryValue,
    {
        let options = self.config().resolve(&QueryOptions::default());
        let query = self.cache.get_or_create::<V>(key, options.gc_time)?;
        if let Some(data) = query.fresh_data(options.stale_time) {
            return Ok(data);
        }
        let fetch = query_executor::execute(&query, query_fn, FetchMode::Dedupe);
        Ok(fetch.await?)
    }

    /// Prefetch a query and store it in cache. Fetch errors are recorded in the query state
    /// only.
    ///
    /// If you need the result opt for [`fetch_query()`](Self::fetch_query).
    pub async fn prefetch_query<V>(&self, key: &QueryKey, query_fn: QueryFn<V>) -> Result<(), QueryError>
    where
        V: QueryValue,
    {
        match self.fetch_query(key, query_fn).await {
            Ok(_) | Err(QueryError::Fetch(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// The cached data of a query, if any.
    pub fn get_query_data<V>(&self, key: &QueryKey) -> Result<Option<V>, QueryError>
    where
        V: QueryValue,
    {
        Ok(self
            .cache
            .get_query::<V>(key)?
            .and_then(|query| query.with_state(|state| state.data().cloned())))
    }

    /// Retrieve the current state of an existing query, without subscribing to it.
    /// If the query does not exist, [`None`](Option::None) will be returned.
    pub fn get_query_state<V>(&self, key: &QueryKey) -> Result<Option<QueryState<V>>, QueryError>
    where
        V: QueryValue,
    {
        self.cache.get::<V>(key)
    }

    /// Immediately set a query's data. If the query does not exist, it will be created.
    ///
    /// If you need to fetch the data asynchronously, use [`fetch_query`](Self::fetch_query) or
    /// [`prefetch_query`](Self::prefetch_query).
    pub fn set_query_data<V>(&self, key: &QueryKey, data: V) -> Result<(), QueryError>
    where
        V: QueryValue,
    {
        self.cache.set(key, QueryStatePatch::success(data))
    }

    /// Update a query's data from its current data.
    ///
    /// If the updater function returns [`None`](Option::None), the query data will not be
    /// updated. If it receives [`None`](Option::None) as input, returning
    /// [`None`](Option::None) bails out of the update and no cache entry is created.
    ///
    /// Returns whether the data was written.
    ///
    /// ```
    /// # use std::rc::Rc;
    /// # use query_core::{query_key, ManualRuntime, QueryClient, QueryClientConfig};
    /// # let client = QueryClient::new(QueryClientConfig::default(), Rc::new(ManualRuntime::new()));
    /// let key = query_key!["monkey", 0];
    /// // Overwrite existing data.
    /// client.update_query_data::<String>(&key, |_| Some("George".to_string())).unwrap();
    ///
    /// // Don't overwrite George.
    /// let updated = client
    ///     .update_query_data::<String>(&key, |name| match name {
    ///         Some(name) if name == "George" => None,
    ///         _ => Some("Luffy".to_string()),
    ///     })
    ///     .unwrap();
    /// assert!(!updated);
    /// ```
    pub fn update_query_data<V>(
        &self,
        key: &QueryKey,
        updater: impl FnOnce(Option<&V>) -> Option<V>,
    ) -> Result<bool, QueryError>
    where
        V: QueryValue,
    {
        let current = self.get_query_data::<V>(key)?;
        match updater(current.as_ref()) {
            Some(data) => {
                self.set_query_data(key, data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mutate the existing data if it exists.
    ///
    /// Returns whether the data was updated.
    pub fn update_query_data_mut<V>(
        &self,
        key: &QueryKey,
        updater: impl FnOnce(&mut V),
    ) -> Result<bool, QueryError>
    where
        V: QueryValue,
    {
        self.update_query_data::<V>(key, |current| {
            current.cloned().map(|mut data| {
                updater(&mut data);
                data
            })
        })
    }

    /// Marks the matching queries invalid. The ones with an enabled observer are refetched
    /// in the background.
    ///
    /// Returns how many queries matched.
    pub fn invalidate_queries(&self, filter: impl Into<QueryFilter>) -> usize {
        self.cache.invalidate_queries(&filter.into())
    }

    /// Invalidates all queries in the cache.
    pub fn invalidate_all_queries(&self) -> usize {
        self.cache.invalidate_queries(&QueryFilter::all())
    }

    /// Cancel the fetch in flight for a query.
    /// Returns whether a fetch was cancelled.
    pub fn cancel_query(&self, key: &QueryKey) -> bool {
        self.cache.cancel_query(key)
    }

    /// Removes the matching queries.
    ///
    /// An observed query stays in the cache with its data and error dropped, and is refetched
    /// for its observers. Returns how many were removed or reset.
    pub fn remove_queries(&self, filter: impl Into<QueryFilter>) -> usize {
        self.cache.remove_queries(&filter.into(), RemovalReason::Removed)
    }

    /// Clears the cache. Unobserved queries are removed, observed ones are reset.
    pub fn clear(&self) -> usize {
        self.cache.remove_queries(&QueryFilter::all(), RemovalReason::Cleared)
    }

    /// Calls `callback` with every new state of a query, creating the query if needed.
    ///
    /// The query is kept alive until the returned [`Subscription`] is dropped.
    pub fn subscribe<V>(
        &self,
        key: &QueryKey,
        callback: impl Fn(&QueryState<V>) + 'static,
    ) -> Result<Subscription, QueryError>
    where
        V: QueryValue,
    {
        let id = self.cache.subscribe::<V>(key, callback)?;
        Ok(Subscription {
            cache: self.cache.clone(),
            key: key.clone(),
            id: Some(id),
        })
    }

    /// Creates an observer of `key`, fetching if its data is missing or stale.
    pub fn observer<V, R>(
        &self,
        key: &QueryKey,
        query_fn: QueryFn<V>,
        options: QueryObserverOptions<V, R>,
    ) -> Result<QueryObserver<V, R>, QueryError>
    where
        V: QueryValue,
        R: StructuralShare + 'static,
    {
        QueryObserver::new(&self.cache, key, query_fn, options)
    }

    /// Creates a mutation whose invalidations target this client's cache.
    pub fn mutation<Vars, Data, Ctx>(
        &self,
        options: MutationOptions<Vars, Data, Ctx>,
    ) -> Mutation<Vars, Data, Ctx>
    where
        Vars: Clone + 'static,
        Data: Clone + 'static,
        Ctx: 'static,
    {
        Mutation::new(&self.cache, options)
    }

    /// Registers the cache observer.
    pub fn register_cache_observer(&self, observer: impl CacheObserver + 'static) -> CacheObserverKey {
        self.cache.register_observer(observer)
    }

    /// Removes a cache observer.
    pub fn unregister_cache_observer(&self, key: CacheObserverKey) -> bool {
        self.cache.unregister_observer(key)
    }

    /// Snapshots the data of every query. See [`QueryCache::dehydrate`].
    pub fn dehydrate(&self) -> Result<DehydratedState, QueryError> {
        self.cache.dehydrate()
    }

    /// Pre-populates the cache. See [`QueryCache::hydrate`].
    pub fn hydrate<V>(&self, state: &DehydratedState) -> Result<usize, QueryError>
    where
        V: QueryValue,
    {
        self.cache.hydrate::<V>(state)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        time::Duration,
    };

    use super::*;
    use crate::{query_fn, query_key, FetchError, ManualRuntime};

    fn client() -> (ManualRuntime, QueryClient) {
        let runtime = ManualRuntime::new();
        let client = QueryClient::new(QueryClientConfig::default(), Rc::new(runtime.clone()));
        (runtime, client)
    }

    #[test]
    fn update_query_data() {
        let (_, client) = client();
        let key = query_key![0];

        let state = || client.get_query_data::<String>(&key).unwrap();

        assert_eq!(None, state());
        assert_eq!(0, client.get_query_cache().size());

        assert!(!client.update_query_data::<String>(&key, |_| None).unwrap());

        assert_eq!(None, state());
        assert_eq!(0, client.get_query_cache().size());

        client
            .update_query_data::<String>(&key, |_| Some("0".to_string()))
            .unwrap();

        assert_eq!(1, client.get_query_cache().size());
        assert_eq!(Some("0".to_string()), state());

        client
            .update_query_data::<String>(&key, |_| Some("1".to_string()))
            .unwrap();

        assert_eq!(Some("1".to_string()), state());
    }

    #[test]
    fn set_query_data_new_query() {
        let (_, client) = client();
        let key = query_key![0];

        // Query does not exist
        assert_eq!(None, client.get_query_data::<String>(&key).unwrap());

        client
            .set_query_data::<String>(&key, "New Data".to_string())
            .unwrap();

        assert_eq!(
            Some("New Data".to_string()),
            client.get_query_data::<String>(&key).unwrap()
        );
    }

    #[test]
    fn set_query_data_existing_query() {
        let (_, client) = client();
        let key = query_key![1];

        client
            .set_query_data::<String>(&key, "Initial Data".to_string())
            .unwrap();
        assert_eq!(
            Some("Initial Data".to_string()),
            client.get_query_data::<String>(&key).unwrap()
        );

        client
            .set_query_data::<String>(&key, "Updated Data".to_string())
            .unwrap();
        assert_eq!(
            Some("Updated Data".to_string()),
            client.get_query_data::<String>(&key).unwrap()
        );
    }

    #[test]
    fn same_key_with_a_different_value_type_is_rejected() {
        let (_, client) = client();
        let key = query_key![0];

        client.set_query_data::<String>(&key, "0".to_string()).unwrap();

        let error = client.set_query_data::<u32>(&key, 1234).unwrap_err();
        assert!(matches!(error, QueryError::TypeMismatch { .. }));
        assert_eq!(
            Some("0".to_string()),
            client.get_query_data::<String>(&key).unwrap()
        );
        assert_eq!(1, client.get_query_cache().size());
    }

    #[test]
    fn can_invalidate_while_subscribed() {
        let (_, client) = client();
        let key = query_key![0];

        let states = Rc::new(RefCell::new(Vec::new()));
        let seen = states.clone();
        let _subscription = client
            .subscribe::<u32>(&key, move |state| seen.borrow_mut().push(state.clone()))
            .unwrap();

        client.set_query_data::<u32>(&key, 1234).unwrap();
        assert_eq!(1, client.invalidate_queries(key.clone()));

        let last = states.borrow().last().cloned().unwrap();
        assert!(last.is_invalidated, "Query should be invalid");
        assert_eq!(last.data(), Some(&1234));
    }

    #[test]
    fn can_invalidate_subset() {
        let (_, client) = client();

        client.set_query_data::<u32>(&query_key!["todos", 0], 1).unwrap();
        client.set_query_data::<u32>(&query_key!["todos", 1], 2).unwrap();
        client.set_query_data::<u32>(&query_key!["users", 0], 3).unwrap();

        let invalidated = client.invalidate_queries(QueryFilter::prefix(query_key!["todos"]));
        assert_eq!(2, invalidated);

        let invalid = |key: QueryKey| {
            client
                .get_query_state::<u32>(&key)
                .unwrap()
                .unwrap()
                .is_invalidated
        };
        assert!(invalid(query_key!["todos", 0]));
        assert!(invalid(query_key!["todos", 1]));
        assert!(!invalid(query_key!["users", 0]));
    }

    #[test]
    fn invalidate_all() {
        let (_, client) = client();

        client.set_query_data::<String>(&query_key!["0"], "1234".into()).unwrap();
        client.set_query_data::<String>(&query_key!["1"], "5678".into()).unwrap();
        client.set_query_data::<u32>(&query_key![0], 1234).unwrap();
        client.set_query_data::<u32>(&query_key![1], 5678).unwrap();

        assert_eq!(4, client.invalidate_all_queries());
        assert!(client
            .get_query_cache()
            .get_all()
            .iter()
            .all(|info| info.is_invalidated));
    }

    #[test]
    fn update_query_data_mut() {
        let (_, client) = client();
        let state = |key: u32| client.get_query_data::<u32>(&query_key![key]).unwrap();

        let initial_value = 100_u32;
        client.set_query_data::<u32>(&query_key![0], initial_value).unwrap();
        assert_eq!(state(0), Some(100));

        let update_result = client
            .update_query_data_mut::<u32>(&query_key![0], |data| *data += 50)
            .unwrap();

        assert!(update_result, "Expected data to be updated");
        assert_eq!(state(0), Some(initial_value + 50), "Data was not updated correctly");

        // Negative Case: Attempt to update a non-existent query
        let non_existent_update_result = client
            .update_query_data_mut::<u32>(&query_key![1], |data| *data += 50)
            .unwrap();

        assert!(
            !non_existent_update_result,
            "Expected no data to be updated for a non-existent query"
        );
        assert_eq!(state(1), None, "Data was updated for a non-existent query")
    }

    #[test]
    fn fetch_query_returns_fresh_data_without_fetching() {
        let runtime = ManualRuntime::new();
        let client = QueryClient::new(
            QueryClientConfig::default().set_stale_time(None),
            Rc::new(runtime.clone()),
        );
        let key = query_key!["answer"];
        let calls = Rc::new(std::cell::Cell::new(0));
        let counter = calls.clone();
        let fetch = query_fn(move || {
            counter.set(counter.get() + 1);
            async { Ok::<_, FetchError>(42_u32) }
        });

        assert_eq!(runtime.block_on(client.fetch_query(&key, fetch.clone())), Ok(42));
        assert_eq!(runtime.block_on(client.fetch_query(&key, fetch)), Ok(42));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn fetch_query_and_observers_share_the_stale_time() {
        let runtime = ManualRuntime::new();
        let client = QueryClient::new(
            QueryClientConfig::default()
                .set_stale_time(None)
                .set_gc_time(Some(Duration::from_secs(1))),
            Rc::new(runtime.clone()),
        );
        let key = query_key!["answer"];
        let _subscription = client.subscribe::<u32>(&key, |_| {}).unwrap();
        client.set_query_data::<u32>(&key, 1).unwrap();
        runtime.advance(Duration::from_secs(2));

        let observer = client
            .observer(
                &key,
                query_fn(|| async { Ok::<_, FetchError>(2_u32) }),
                QueryObserverOptions::new(QueryOptions::default().set_enabled(false)),
            )
            .unwrap();
        assert!(observer.get_current_result().is_stale);

        let fetch = query_fn(|| async { Ok::<_, FetchError>(2_u32) });
        assert_eq!(runtime.block_on(client.fetch_query(&key, fetch)), Ok(2));
        assert!(!observer.get_current_result().is_stale);
    }

    #[test]
    fn prefetch_query_records_errors_in_state() {
        let (runtime, client) = client();
        let key = query_key!["broken"];
        let fetch = query_fn(|| async { Err::<u32, _>(FetchError::network("offline")) });

        assert_eq!(runtime.block_on(client.prefetch_query(&key, fetch.clone())), Ok(()));
        let state = client.get_query_state::<u32>(&key).unwrap().unwrap();
        assert_eq!(state.error, Some(FetchError::network("offline")));

        let error = runtime.block_on(client.fetch_query(&key, fetch)).unwrap_err();
        assert!(matches!(error, QueryError::Fetch(_)));
    }

    #[test]
    fn dropping_a_subscription_starts_gc() {
        let (runtime, client) = client();
        let key = query_key!["subscribed"];

        let subscription = client.subscribe::<u32>(&key, |_| {}).unwrap();
        assert_eq!(runtime.pending_timers(), 0);

        drop(subscription);
        assert_eq!(runtime.pending_timers(), 1);

        runtime.advance(client.config().gc_time.unwrap());
        assert!(!client.get_query_cache().contains(&key));
    }

    #[test]
    fn removing_an_observed_query_keeps_it_shared() {
        let (runtime, client) = client();
        let key = query_key!["observed"];
        let calls = Rc::new(Cell::new(0_u32));
        let counter = calls.clone();
        let fetch = query_fn(move || {
            counter.set(counter.get() + 1);
            let call = counter.get();
            async move { Ok::<_, FetchError>(call) }
        });
        let observer = client
            .observer(&key, fetch, QueryObserverOptions::new(QueryOptions::default()))
            .unwrap();
        runtime.run_until_stalled();
        assert_eq!(observer.get_current_result().data, Some(1));

        assert_eq!(1, client.remove_queries(key.clone()));
        assert!(client.get_query_cache().contains(&key));
        assert_eq!(observer.get_current_result().data, None);
        runtime.run_until_stalled();
        assert_eq!(observer.get_current_result().data, Some(2));

        let refetch = observer.refetch().unwrap();
        assert_eq!(runtime.block_on(refetch), Ok(3));
        client.set_query_data::<u32>(&key, 4).unwrap();
        assert_eq!(observer.get_current_result().data, Some(4));
        assert_eq!(client.get_query_data::<u32>(&key).unwrap(), Some(4));
    }

    #[test]
    fn remove_and_clear() {
        let (_, client) = client();
        client.set_query_data::<u32>(&query_key!["a", 1], 1).unwrap();
        client.set_query_data::<u32>(&query_key!["a", 2], 2).unwrap();
        client.set_query_data::<u32>(&query_key!["b"], 3).unwrap();

        assert_eq!(2, client.remove_queries(QueryFilter::prefix(query_key!["a"])));
        assert_eq!(1, client.get_query_cache().size());
        assert_eq!(1, client.clear());
        assert_eq!(0, client.get_query_cache().size());
    }
}
