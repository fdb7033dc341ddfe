use std::time::Duration;

use crate::{instant::is_stale_at, replace_equal_deep, FetchError, Instant, StructuralShare};

/// Cached state of one query.
///
/// The last successful value survives failed and in-flight fetches, so consumers can keep
/// rendering "last known good data" next to an error or a refresh indicator.
#[derive(Clone, PartialEq)]
pub struct QueryState<V> {
    /// Last successfully resolved value. `None` before the first success.
    pub data: Option<QueryData<V>>,
    /// Last error. Cleared by the next successful fetch.
    pub error: Option<FetchError>,
    /// When the last error was recorded.
    pub error_updated_at: Option<Instant>,
    /// Whether a fetch is in flight.
    pub fetch_status: FetchStatus,
    /// Set by invalidation. Invalidated data is stale regardless of its age.
    pub is_invalidated: bool,
    /// Failed fetches since the last success.
    pub fetch_failure_count: u32,
}

/// Whether a fetch is currently running for a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchStatus {
    /// No fetch in flight.
    #[default]
    Idle,
    /// A fetch is in flight.
    Fetching,
}

/// Coarse outcome of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data and no error yet.
    Pending,
    /// Data present and the last fetch did not fail.
    Success,
    /// The last fetch failed.
    Error,
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            error_updated_at: None,
            fetch_status: FetchStatus::Idle,
            is_invalidated: false,
            fetch_failure_count: 0,
        }
    }
}

impl<V> QueryState<V> {
    /// Returns the data contained within the QueryState, if present.
    pub fn data(&self) -> Option<&V> {
        self.data.as_ref().map(|data| &data.data)
    }

    /// Returns the last updated timestamp for the QueryState, if present.
    pub fn updated_at(&self) -> Option<Instant> {
        self.data.as_ref().map(|data| data.updated_at)
    }

    /// A fetch is in flight, including background refetches.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// The very first fetch is in flight: there is no data yet.
    pub fn is_loading(&self) -> bool {
        self.is_fetching() && self.data.is_none()
    }

    /// Coarse outcome of the query.
    pub fn status(&self) -> QueryStatus {
        if self.error.is_some() {
            QueryStatus::Error
        } else if self.data.is_some() {
            QueryStatus::Success
        } else {
            QueryStatus::Pending
        }
    }

    /// Whether the data needs a refetch at `now`.
    ///
    /// Missing and invalidated data is always stale.
    pub fn is_stale(&self, stale_time: Option<Duration>, now: Instant) -> bool {
        match self.updated_at() {
            _ if self.is_invalidated => true,
            Some(updated_at) => is_stale_at(updated_at, stale_time, now),
            None => true,
        }
    }

    /// Transforms the data, keeping all other fields.
    pub fn map_data<R>(&self, mapper: impl FnOnce(&V) -> R) -> QueryState<R> {
        QueryState {
            data: self.data.as_ref().map(|data| QueryData {
                data: mapper(&data.data),
                updated_at: data.updated_at,
            }),
            error: self.error.clone(),
            error_updated_at: self.error_updated_at,
            fetch_status: self.fetch_status,
            is_invalidated: self.is_invalidated,
            fetch_failure_count: self.fetch_failure_count,
        }
    }
}

impl<V> std::fmt::Debug for QueryState<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("fetch_status", &self.fetch_status)
            .field("is_invalidated", &self.is_invalidated)
            .finish()
    }
}

/// The latest data for a Query.
#[derive(Clone, PartialEq, Eq)]
pub struct QueryData<V> {
    /// The Data.
    pub data: V,
    /// The instant this data was retrieved.
    pub updated_at: Instant,
}

impl<V> QueryData<V> {
    /// Creates a new QueryData with the given data and timestamp.
    pub fn new(data: V, updated_at: Instant) -> Self {
        Self { data, updated_at }
    }
}

impl<V> std::fmt::Debug for QueryData<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryData")
            .field("data", &self.data)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// A partial update merged into a [`QueryState`] in one step.
///
/// Fields left as `None` keep their current value.
#[derive(Clone, Debug)]
pub struct QueryStatePatch<V> {
    /// New data. Structurally shared with the previous data.
    pub data: Option<V>,
    /// Timestamp for `data`. Defaults to the current time.
    pub updated_at: Option<Instant>,
    /// New error, `Some(None)` clears it.
    pub error: Option<Option<FetchError>>,
    /// New fetch status.
    pub fetch_status: Option<FetchStatus>,
    /// New invalidation flag.
    pub is_invalidated: Option<bool>,
}

impl<V> Default for QueryStatePatch<V> {
    fn default() -> Self {
        Self {
            data: None,
            updated_at: None,
            error: None,
            fetch_status: None,
            is_invalidated: None,
        }
    }
}

impl<V> QueryStatePatch<V> {
    /// A patch that writes fresh data, clearing any error and invalidation.
    pub fn success(data: V) -> Self {
        Self {
            data: Some(data),
            error: Some(None),
            is_invalidated: Some(false),
            ..Self::default()
        }
    }

    /// Set the data.
    pub fn set_data(self, data: V) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    /// Set the data timestamp.
    pub fn set_updated_at(self, updated_at: Instant) -> Self {
        Self {
            updated_at: Some(updated_at),
            ..self
        }
    }

    /// Set or clear the error.
    pub fn set_error(self, error: Option<FetchError>) -> Self {
        Self {
            error: Some(error),
            ..self
        }
    }

    /// Set the fetch status.
    pub fn set_fetch_status(self, fetch_status: FetchStatus) -> Self {
        Self {
            fetch_status: Some(fetch_status),
            ..self
        }
    }

    /// Set the invalidation flag.
    pub fn set_invalidated(self, is_invalidated: bool) -> Self {
        Self {
            is_invalidated: Some(is_invalidated),
            ..self
        }
    }

    pub(crate) fn apply(self, state: &mut QueryState<V>, now: Instant)
    where
        V: StructuralShare,
    {
        if let Some(data) = self.data {
            let data = match state.data() {
                Some(prev) => replace_equal_deep(prev, data),
                None => data,
            };
            state.data = Some(QueryData::new(data, self.updated_at.unwrap_or(now)));
        }
        if let Some(error) = self.error {
            if error.is_some() {
                state.error_updated_at = Some(now);
            }
            state.error = error;
        }
        if let Some(fetch_status) = self.fetch_status {
            state.fetch_status = fetch_status;
        }
        if let Some(is_invalidated) = self.is_invalidated {
            state.is_invalidated = is_invalidated;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn loading_only_without_data() {
        let mut state = QueryState::<u32> {
            fetch_status: FetchStatus::Fetching,
            ..Default::default()
        };
        assert!(state.is_loading());
        assert!(state.is_fetching());

        state.data = Some(QueryData::new(1, Instant::from_millis(0)));
        assert!(!state.is_loading());
        assert!(state.is_fetching());
    }

    #[test]
    fn status_prefers_error_over_data() {
        let mut state = QueryState::<u32>::default();
        assert_eq!(state.status(), QueryStatus::Pending);

        state.data = Some(QueryData::new(1, Instant::from_millis(0)));
        assert_eq!(state.status(), QueryStatus::Success);

        state.error = Some(FetchError::network("offline"));
        assert_eq!(state.status(), QueryStatus::Error);
        assert_eq!(state.data(), Some(&1));
    }

    #[test]
    fn staleness() {
        let stale_time = Some(Duration::from_millis(100));
        let mut state = QueryState::<u32>::default();
        assert!(state.is_stale(stale_time, Instant::from_millis(0)));

        state.data = Some(QueryData::new(1, Instant::from_millis(1_000)));
        assert!(!state.is_stale(stale_time, Instant::from_millis(1_050)));
        assert!(state.is_stale(stale_time, Instant::from_millis(1_101)));
        assert!(!state.is_stale(None, Instant::from_millis(1_000_000)));

        state.is_invalidated = true;
        assert!(state.is_stale(None, Instant::from_millis(1_000)));
    }

    #[test]
    fn patch_merges_only_given_fields() {
        let mut state = QueryState::<u32> {
            error: Some(FetchError::network("offline")),
            ..Default::default()
        };

        QueryStatePatch::default()
            .set_fetch_status(FetchStatus::Fetching)
            .apply(&mut state, Instant::from_millis(5));
        assert!(state.is_fetching());
        assert!(state.error.is_some());

        QueryStatePatch::success(7).apply(&mut state, Instant::from_millis(9));
        assert_eq!(state.data(), Some(&7));
        assert_eq!(state.updated_at(), Some(Instant::from_millis(9)));
        assert!(state.error.is_none());
        assert!(state.is_fetching());
    }

    #[test]
    fn patch_shares_structure_with_previous_data() {
        let original = Rc::new(vec![1_u32, 2, 3]);
        let mut state = QueryState::default();
        QueryStatePatch::success(original.clone()).apply(&mut state, Instant::from_millis(0));

        QueryStatePatch::success(Rc::new(vec![1, 2, 3])).apply(&mut state, Instant::from_millis(1));

        assert!(Rc::ptr_eq(state.data().unwrap(), &original));
        assert_eq!(state.updated_at(), Some(Instant::from_millis(1)));
    }
}
