use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

use futures::{future::LocalBoxFuture, FutureExt};
use slotmap::SlotMap;

use crate::{FetchError, QueryCache, QueryFilter, QueryKey};

/// The request a mutation performs.
pub type MutationFn<Vars, Data> = Rc<dyn Fn(Vars) -> LocalBoxFuture<'static, Result<Data, FetchError>>>;

slotmap::new_key_type! {
    /// Identifies a listener registered with [`Mutation::subscribe`].
    pub struct MutationListenerKey;
}

/// Queries to invalidate after a successful mutation.
///
/// Every key is used as a prefix filter.
pub enum InvalidateKeys<Vars, Data, Ctx> {
    /// A fixed list.
    Static(Vec<QueryKey>),
    /// Derived from the result, the variables and the context of the call.
    Computed(Rc<dyn Fn(&Data, &Vars, &Ctx) -> Vec<QueryKey>>),
}

impl<Vars, Data, Ctx> Clone for InvalidateKeys<Vars, Data, Ctx> {
    fn clone(&self) -> Self {
        match self {
            InvalidateKeys::Static(keys) => InvalidateKeys::Static(keys.clone()),
            InvalidateKeys::Computed(keys) => InvalidateKeys::Computed(keys.clone()),
        }
    }
}

/// Configuration of a [`Mutation`].
///
/// `Ctx` is whatever `on_mutate` returns. It is the only state carried from the start of a
/// call to its callbacks, typically a snapshot used to roll back an optimistic update.
pub struct MutationOptions<Vars, Data, Ctx = ()> {
    mutation_fn: MutationFn<Vars, Data>,
    on_mutate: Rc<dyn Fn(&Vars) -> Ctx>,
    on_success: Option<Rc<dyn Fn(&Data, &Vars, &Ctx)>>,
    on_error: Option<Rc<dyn Fn(&FetchError, &Vars, &Ctx)>>,
    on_settled: Option<Rc<dyn Fn(&Result<Data, FetchError>, &Vars, &Ctx)>>,
    invalidates: Option<InvalidateKeys<Vars, Data, Ctx>>,
}

impl<Vars, Data> MutationOptions<Vars, Data, ()>
where
    Vars: 'static,
    Data: 'static,
{
    /// Options for a mutation without a context.
    pub fn new<F, Fu>(mutation_fn: F) -> Self
    where
        F: Fn(Vars) -> Fu + 'static,
        Fu: Future<Output = Result<Data, FetchError>> + 'static,
    {
        Self::with_context(mutation_fn, |_| ())
    }
}

impl<Vars, Data, Ctx> MutationOptions<Vars, Data, Ctx>
where
    Vars: 'static,
    Data: 'static,
{
    /// Options for a mutation whose `on_mutate` produces a context for the callbacks.
    pub fn with_context<F, Fu>(mutation_fn: F, on_mutate: impl Fn(&Vars) -> Ctx + 'static) -> Self
    where
        F: Fn(Vars) -> Fu + 'static,
        Fu: Future<Output = Result<Data, FetchError>> + 'static,
    {
        Self {
            mutation_fn: Rc::new(move |variables| mutation_fn(variables).boxed_local()),
            on_mutate: Rc::new(on_mutate),
            on_success: None,
            on_error: None,
            on_settled: None,
            invalidates: None,
        }
    }

    /// Runs after every successful call, before invalidation.
    pub fn set_on_success(self, on_success: impl Fn(&Data, &Vars, &Ctx) + 'static) -> Self {
        Self {
            on_success: Some(Rc::new(on_success)),
            ..self
        }
    }

    /// Runs after every failed call.
    pub fn set_on_error(self, on_error: impl Fn(&FetchError, &Vars, &Ctx) + 'static) -> Self {
        Self {
            on_error: Some(Rc::new(on_error)),
            ..self
        }
    }

    /// Runs after every call, after `on_success` or `on_error`.
    pub fn set_on_settled(
        self,
        on_settled: impl Fn(&Result<Data, FetchError>, &Vars, &Ctx) + 'static,
    ) -> Self {
        Self {
            on_settled: Some(Rc::new(on_settled)),
            ..self
        }
    }

    /// Invalidates these keys, and every key they prefix, after a successful call.
    pub fn set_invalidates(self, keys: Vec<QueryKey>) -> Self {
        Self {
            invalidates: Some(InvalidateKeys::Static(keys)),
            ..self
        }
    }

    /// Invalidates the keys computed from the outcome of a successful call.
    pub fn set_invalidates_with(
        self,
        keys: impl Fn(&Data, &Vars, &Ctx) -> Vec<QueryKey> + 'static,
    ) -> Self {
        Self {
            invalidates: Some(InvalidateKeys::Computed(Rc::new(keys))),
            ..self
        }
    }
}

impl<Vars, Data, Ctx> Clone for MutationOptions<Vars, Data, Ctx> {
    fn clone(&self) -> Self {
        Self {
            mutation_fn: self.mutation_fn.clone(),
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
            invalidates: self.invalidates.clone(),
        }
    }
}

/// Callbacks for a single [`Mutation::mutate`] call.
///
/// They run after the callbacks of [`MutationOptions`], even when the mutation was reset
/// in the meantime.
pub struct MutateCallbacks<Vars, Data, Ctx = ()> {
    on_success: Option<Box<dyn FnOnce(&Data, &Vars, &Ctx)>>,
    on_error: Option<Box<dyn FnOnce(&FetchError, &Vars, &Ctx)>>,
    on_settled: Option<Box<dyn FnOnce(&Result<Data, FetchError>, &Vars, &Ctx)>>,
}

impl<Vars, Data, Ctx> Default for MutateCallbacks<Vars, Data, Ctx> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<Vars, Data, Ctx> MutateCallbacks<Vars, Data, Ctx> {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the success callback.
    pub fn set_on_success(self, on_success: impl FnOnce(&Data, &Vars, &Ctx) + 'static) -> Self {
        Self {
            on_success: Some(Box::new(on_success)),
            ..self
        }
    }

    /// Set the error callback.
    pub fn set_on_error(self, on_error: impl FnOnce(&FetchError, &Vars, &Ctx) + 'static) -> Self {
        Self {
            on_error: Some(Box::new(on_error)),
            ..self
        }
    }

    /// Set the callback that runs last.
    pub fn set_on_settled(
        self,
        on_settled: impl FnOnce(&Result<Data, FetchError>, &Vars, &Ctx) + 'static,
    ) -> Self {
        Self {
            on_settled: Some(Box::new(on_settled)),
            ..self
        }
    }

    fn run(self, result: &Result<Data, FetchError>, variables: &Vars, context: &Ctx) {
        match result {
            Ok(data) => {
                if let Some(on_success) = self.on_success {
                    on_success(data, variables, context);
                }
            }
            Err(error) => {
                if let Some(on_error) = self.on_error {
                    on_error(error, variables, context);
                }
            }
        }
        if let Some(on_settled) = self.on_settled {
            on_settled(result, variables, context);
        }
    }
}

/// Lifecycle of a mutation: `Idle → Pending → (Success | Error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
    /// Not started, or reset.
    #[default]
    Idle,
    /// A call is in flight.
    Pending,
    /// The last call succeeded.
    Success,
    /// The last call failed.
    Error,
}

/// State of a [`Mutation`]. Lives with the mutation, never in the query cache.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationState<Data, Vars> {
    /// Where the mutation is in its lifecycle.
    pub status: MutationStatus,
    /// Result of the last successful call.
    pub data: Option<Data>,
    /// Error of the last failed call.
    pub error: Option<FetchError>,
    /// Variables of the last call.
    pub variables: Option<Vars>,
}

impl<Data, Vars> Default for MutationState<Data, Vars> {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
        }
    }
}

impl<Data, Vars> MutationState<Data, Vars> {
    /// Not started.
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    /// A call is in flight.
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// The last call succeeded.
    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    /// The last call failed.
    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

/// A one-shot, side-effecting request that can invalidate queries when it succeeds.
///
/// Clones share the same state.
pub struct Mutation<Vars, Data, Ctx = ()> {
    inner: Rc<MutationInner<Vars, Data, Ctx>>,
}

type MutationListener<Data, Vars> = Rc<dyn Fn(&MutationState<Data, Vars>)>;

struct MutationInner<Vars, Data, Ctx> {
    cache: QueryCache,
    options: MutationOptions<Vars, Data, Ctx>,
    state: RefCell<MutationState<Data, Vars>>,
    generation: Cell<u64>,
    listeners: RefCell<SlotMap<MutationListenerKey, MutationListener<Data, Vars>>>,
}

impl<Vars, Data, Ctx> Clone for Mutation<Vars, Data, Ctx> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Vars, Data, Ctx> Mutation<Vars, Data, Ctx>
where
    Vars: Clone + 'static,
    Data: Clone + 'static,
    Ctx: 'static,
{
    /// Creates an idle mutation that invalidates queries of `cache`.
    pub fn new(cache: &QueryCache, options: MutationOptions<Vars, Data, Ctx>) -> Self {
        Self {
            inner: Rc::new(MutationInner {
                cache: cache.clone(),
                options,
                state: RefCell::new(MutationState::default()),
                generation: Cell::new(0),
                listeners: RefCell::new(SlotMap::with_key()),
            }),
        }
    }

    /// Runs the mutation in the background.
    ///
    /// A failure is recorded in the state and passed to the error callbacks. It never
    /// escapes this call.
    pub fn mutate(&self, variables: Vars, callbacks: MutateCallbacks<Vars, Data, Ctx>) {
        let (generation, context, request) = self.inner.begin(variables.clone());
        let inner = self.inner.clone();
        self.inner.cache.runtime().spawn_local(
            async move {
                let result = request.await;
                inner.settle(generation, &variables, &context, &result);
                callbacks.run(&result, &variables, &context);
            }
            .boxed_local(),
        );
    }

    /// Runs the mutation and resolves with its outcome.
    ///
    /// `on_mutate` runs and the state turns pending right away, before the returned future
    /// is first polled. The call is driven on the cache's runtime, so it settles and runs its
    /// callbacks even when the returned future is dropped.
    pub fn mutate_async(&self, variables: Vars) -> LocalBoxFuture<'static, Result<Data, FetchError>> {
        let (generation, context, request) = self.inner.begin(variables.clone());
        let inner = self.inner.clone();
        let future = async move {
            let result = request.await;
            inner.settle(generation, &variables, &context, &result);
            result
        }
        .boxed_local()
        .shared();

        let driver = future.clone();
        self.inner.cache.runtime().spawn_local(
            async move {
                let _ = driver.await;
            }
            .boxed_local(),
        );

        future.boxed_local()
    }

    /// Returns the mutation to idle and detaches any call in flight.
    pub fn reset(&self) {
        self.inner.next_generation();
        self.inner.set_state(MutationState::default());
    }

    /// The current state.
    pub fn state(&self) -> MutationState<Data, Vars> {
        self.inner.state.borrow().clone()
    }

    /// Registers a listener that receives every state transition.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationState<Data, Vars>) + 'static,
    ) -> MutationListenerKey {
        self.inner.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, key: MutationListenerKey) -> bool {
        self.inner.listeners.borrow_mut().remove(key).is_some()
    }
}

impl<Vars, Data, Ctx> MutationInner<Vars, Data, Ctx>
where
    Vars: Clone + 'static,
    Data: Clone + 'static,
    Ctx: 'static,
{
    fn next_generation(&self) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        generation
    }

    fn begin(&self, variables: Vars) -> (u64, Ctx, LocalBoxFuture<'static, Result<Data, FetchError>>) {
        let generation = self.next_generation();
        self.set_state(MutationState {
            status: MutationStatus::Pending,
            data: None,
            error: None,
            variables: Some(variables.clone()),
        });

        let context = (self.options.on_mutate)(&variables);
        let request = (self.options.mutation_fn)(variables);
        (generation, context, request)
    }

    fn settle(&self, generation: u64, variables: &Vars, context: &Ctx, result: &Result<Data, FetchError>) {
        match result {
            Ok(data) => {
                if let Some(on_success) = &self.options.on_success {
                    on_success(data, variables, context);
                }
                self.invalidate(data, variables, context);
            }
            Err(error) => {
                tracing::debug!(%error, "mutation failed");
                if let Some(on_error) = &self.options.on_error {
                    on_error(error, variables, context);
                }
            }
        }
        if let Some(on_settled) = &self.options.on_settled {
            on_settled(result, variables, context);
        }

        if self.generation.get() != generation {
            tracing::debug!(generation, "ignoring outcome of a detached mutation call");
            return;
        }
        let state = match result {
            Ok(data) => MutationState {
                status: MutationStatus::Success,
                data: Some(data.clone()),
                error: None,
                variables: Some(variables.clone()),
            },
            Err(error) => MutationState {
                status: MutationStatus::Error,
                data: None,
                error: Some(error.clone()),
                variables: Some(variables.clone()),
            },
        };
        self.set_state(state);
    }

    fn invalidate(&self, data: &Data, variables: &Vars, context: &Ctx) {
        let keys = match &self.options.invalidates {
            Some(InvalidateKeys::Static(keys)) => keys.clone(),
            Some(InvalidateKeys::Computed(keys)) => keys(data, variables, context),
            None => return,
        };
        for key in keys {
            let invalidated = self.cache.invalidate_queries(&QueryFilter::prefix(key.clone()));
            tracing::debug!(key = %key, invalidated, "mutation invalidated queries");
        }
    }

    fn set_state(&self, state: MutationState<Data, Vars>) {
        *self.state.borrow_mut() = state.clone();
        let listeners: Vec<MutationListener<Data, Vars>> =
            self.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(&state);
        }
    }
}
