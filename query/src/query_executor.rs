use futures::{
    future::{self, Either, LocalBoxFuture, Shared},
    FutureExt,
};
use futures_channel::oneshot;

use crate::{
    query::{Query, WeakQuery},
    FetchError, FetchStatus, QueryFn, QueryStatePatch, QueryValue,
};

/// A fetch that any number of callers can await. They all observe the same result.
pub type QueryFuture<V> = Shared<LocalBoxFuture<'static, Result<V, FetchError>>>;

/// The fetch currently running for a key.
pub(crate) struct InFlight<V> {
    pub(crate) generation: u64,
    pub(crate) future: QueryFuture<V>,
    pub(crate) cancel: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Join the fetch in flight, if any.
    Dedupe,
    /// Always start a new fetch. An older one keeps running but its result is discarded.
    Replace,
}

/// Starts a fetch for `query`, or joins the one in flight.
///
/// The fetch is driven on the query's runtime, so it completes even when nobody awaits
/// the returned future.
pub(crate) fn execute<V>(query: &Query<V>, query_fn: QueryFn<V>, mode: FetchMode) -> QueryFuture<V>
where
    V: QueryValue,
{
    if mode == FetchMode::Dedupe {
        if let Some(in_flight) = query.in_flight_future() {
            tracing::debug!(key = %query.key(), "joining fetch in flight");
            return in_flight;
        }
    }

    let generation = query.next_generation();
    let (cancel, cancellation) = oneshot::channel();
    let future = run(query.downgrade(), generation, query_fn(), cancellation)
        .boxed_local()
        .shared();

    // Installed before anyone is notified, so a listener asking for the same key joins it.
    query.install_in_flight(InFlight {
        generation,
        future: future.clone(),
        cancel: Some(cancel),
    });
    tracing::debug!(key = %query.key(), generation, "fetch started");
    query.set_state(QueryStatePatch::default().set_fetch_status(FetchStatus::Fetching));

    let driver = future.clone();
    query.runtime().spawn_local(
        async move {
            let _ = driver.await;
        }
        .boxed_local(),
    );

    future
}

async fn run<V>(
    query: WeakQuery<V>,
    generation: u64,
    fetch: LocalBoxFuture<'static, Result<V, FetchError>>,
    cancellation: oneshot::Receiver<()>,
) -> Result<V, FetchError>
where
    V: QueryValue,
{
    let result = execute_with_cancellation(fetch, cancellation).await;
    if let Some(query) = query.upgrade() {
        settle(&query, generation, &result);
    }
    result
}

async fn execute_with_cancellation<V>(
    fetch: LocalBoxFuture<'static, Result<V, FetchError>>,
    cancellation: oneshot::Receiver<()>,
) -> Result<V, FetchError> {
    match future::select(fetch, cancellation).await {
        Either::Left((result, _)) => result,
        Either::Right((Ok(()), _)) => Err(FetchError::cancelled()),
        // The sender was dropped without cancelling: the fetch was replaced, let it finish.
        Either::Right((Err(oneshot::Canceled), fetch)) => fetch.await,
    }
}

/// Writes the outcome of a fetch, unless a newer fetch has started since.
fn settle<V>(query: &Query<V>, generation: u64, result: &Result<V, FetchError>)
where
    V: QueryValue,
{
    if query.generation() != generation {
        tracing::debug!(
            key = %query.key(),
            generation,
            current = query.generation(),
            "discarding result of superseded fetch"
        );
        return;
    }
    query.finish_in_flight(generation);

    match result {
        Ok(data) => {
            tracing::debug!(key = %query.key(), "fetch succeeded");
            let patch = QueryStatePatch::success(data.clone()).set_fetch_status(FetchStatus::Idle);
            query.update_state(move |state, now| {
                patch.apply(state, now);
                state.fetch_failure_count = 0;
            });
        }
        Err(error) if error.is_cancelled() => {
            query.update_state(|state, _| state.fetch_status = FetchStatus::Idle);
        }
        Err(error) => {
            tracing::debug!(key = %query.key(), %error, "fetch failed");
            let patch = QueryStatePatch::default()
                .set_error(Some(error.clone()))
                .set_fetch_status(FetchStatus::Idle);
            query.update_state(move |state, now| {
                patch.apply(state, now);
                state.fetch_failure_count += 1;
            });
        }
    }
}
