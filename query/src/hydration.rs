//! Moving cached data across process boundaries, e.g. from a server render to a client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Instant, QueryCache, QueryError, QueryFilter, QueryKey, QueryStatePatch, QueryValue};

/// Serializable snapshot of every query that holds data, keyed by normalized key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    /// The queries.
    pub queries: BTreeMap<String, DehydratedQuery>,
}

/// One query of a [`DehydratedState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQuery {
    /// Key of the query.
    pub key: QueryKey,
    /// The data, serialized.
    pub data: serde_json::Value,
    /// When the data was written, in milliseconds since the Unix Epoch.
    pub updated_at: u64,
}

impl QueryCache {
    /// Snapshots the data of every query.
    pub fn dehydrate(&self) -> Result<DehydratedState, QueryError> {
        let mut queries = BTreeMap::new();
        for entry in self.find_matching(&QueryFilter::all()) {
            if let Some(query) = entry.dehydrate()? {
                queries.insert(query.key.hash().to_string(), query);
            }
        }
        Ok(DehydratedState { queries })
    }

    /// Pre-populates the cache with every query of `state`, all holding values of type `V`.
    ///
    /// Returns how many queries were written.
    pub fn hydrate<V>(&self, state: &DehydratedState) -> Result<usize, QueryError>
    where
        V: QueryValue,
    {
        self.hydrate_matching::<V>(state, &QueryFilter::all())
    }

    /// Pre-populates the cache with the queries of `state` selected by `filter`.
    ///
    /// Existing data is only overwritten by strictly newer data. Fails on the first query whose
    /// data does not deserialize into `V`, leaving the queries hydrated before it in place.
    pub fn hydrate_matching<V>(
        &self,
        state: &DehydratedState,
        filter: &QueryFilter,
    ) -> Result<usize, QueryError>
    where
        V: QueryValue,
    {
        let mut hydrated = 0;
        for dehydrated in state.queries.values() {
            if !filter.matches(&dehydrated.key) {
                continue;
            }

            let data: V = serde_json::from_value(dehydrated.data.clone())?;
            let updated_at = Instant::from_millis(dehydrated.updated_at);

            let query = self.get_or_create::<V>(&dehydrated.key, self.config().gc_time)?;
            let newer = query.with_state(|state| {
                state
                    .updated_at()
                    .map_or(true, |current| updated_at > current)
            });
            if !newer {
                tracing::debug!(key = %dehydrated.key, "skipping hydration of older data");
                continue;
            }

            query.set_state(QueryStatePatch::success(data).set_updated_at(updated_at));
            hydrated += 1;
        }
        Ok(hydrated)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{query_key, ManualRuntime, QueryClientConfig};

    fn cache_at(millis: u64) -> QueryCache {
        QueryCache::new(
            QueryClientConfig::default(),
            Rc::new(ManualRuntime::starting_at(Instant::from_millis(millis))),
        )
    }

    #[test]
    fn dehydrate_then_hydrate_restores_data_and_timestamps() {
        let server = cache_at(1_000);
        server
            .set(&query_key!["posts", 1], QueryStatePatch::success("hello".to_string()))
            .unwrap();
        server
            .set::<String>(&query_key!["empty"], QueryStatePatch::default())
            .unwrap();

        let state = server.dehydrate().unwrap();
        assert_eq!(state.queries.len(), 1);

        let wire = serde_json::to_string(&state).unwrap();
        let state: DehydratedState = serde_json::from_str(&wire).unwrap();

        let client = cache_at(5_000);
        assert_eq!(client.hydrate::<String>(&state).unwrap(), 1);

        let restored = client.get::<String>(&query_key!["posts", 1]).unwrap().unwrap();
        assert_eq!(restored.data().map(String::as_str), Some("hello"));
        assert_eq!(restored.updated_at(), Some(Instant::from_millis(1_000)));
    }

    #[test]
    fn hydration_never_overwrites_newer_data() {
        let server = cache_at(1_000);
        server
            .set(&query_key!["n"], QueryStatePatch::success(1_u32))
            .unwrap();
        let state = server.dehydrate().unwrap();

        let client = cache_at(2_000);
        client
            .set(&query_key!["n"], QueryStatePatch::success(2_u32))
            .unwrap();

        assert_eq!(client.hydrate::<u32>(&state).unwrap(), 0);
        assert_eq!(
            client.get::<u32>(&query_key!["n"]).unwrap().unwrap().data(),
            Some(&2)
        );
    }

    #[test]
    fn hydrate_matching_selects_by_prefix() {
        let server = cache_at(1_000);
        server
            .set(&query_key!["count", "a"], QueryStatePatch::success(1_u32))
            .unwrap();
        server
            .set(&query_key!["name", "a"], QueryStatePatch::success("a".to_string()))
            .unwrap();
        let state = server.dehydrate().unwrap();

        let client = cache_at(0);
        assert!(matches!(
            client.hydrate::<u32>(&state),
            Err(QueryError::Serialization(_))
        ));

        let client = cache_at(0);
        let counts = QueryFilter::prefix(query_key!["count"]);
        assert_eq!(client.hydrate_matching::<u32>(&state, &counts).unwrap(), 1);
        let names = QueryFilter::prefix(query_key!["name"]);
        assert_eq!(client.hydrate_matching::<String>(&state, &names).unwrap(), 1);
        assert_eq!(client.size(), 2);
    }
}
