//! The clock and scheduler queries run on.
//!
//! Every timer and background fetch goes through a [`QueryRuntime`], so the cache
//! can be driven by a real executor ([`TokioRuntime`]) or by a virtual clock
//! ([`ManualRuntime`]) that advances only when told to.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    future::Future,
    rc::{Rc, Weak},
    time::Duration,
};

use futures::{
    executor::{LocalPool, LocalSpawner},
    future::LocalBoxFuture,
    task::LocalSpawnExt,
};

use crate::Instant;

cfg_if::cfg_if! {
    if #[cfg(feature = "tokio")] {
        mod tokio_runtime;
        pub use tokio_runtime::TokioRuntime;
    }
}

/// Clock, task spawner and timer facility used by the query cache.
pub trait QueryRuntime {
    /// Current time.
    fn now(&self) -> Instant;

    /// Runs a future to completion in the background.
    fn spawn_local(&self, future: LocalBoxFuture<'static, ()>);

    /// Invokes `callback` once `delay` has elapsed, unless the returned handle is cleared first.
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimeoutHandle;
}

/// Handle to a pending timeout.
///
/// Dropping the handle leaves the timeout scheduled. Call [`TimeoutHandle::clear`] to remove it.
pub struct TimeoutHandle {
    clear: Option<Box<dyn FnOnce()>>,
}

impl TimeoutHandle {
    /// Creates a handle from the function that unschedules the timeout.
    pub fn new(clear: impl FnOnce() + 'static) -> Self {
        Self {
            clear: Some(Box::new(clear)),
        }
    }

    /// Removes the pending timeout. Its callback will not run.
    pub fn clear(mut self) {
        if let Some(clear) = self.clear.take() {
            clear();
        }
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle").finish_non_exhaustive()
    }
}

/// A deterministic runtime with a virtual clock.
///
/// Time only moves through [`advance`](Self::advance). Spawned tasks only make progress
/// inside [`run_until_stalled`](Self::run_until_stalled), [`advance`](Self::advance) or
/// [`block_on`](Self::block_on).
///
/// ```
/// use query_core::{ManualRuntime, QueryRuntime};
/// use std::{cell::Cell, rc::Rc, time::Duration};
///
/// let runtime = ManualRuntime::new();
/// let fired = Rc::new(Cell::new(false));
/// let flag = fired.clone();
/// let _handle = runtime.set_timeout(Duration::from_secs(1), Box::new(move || flag.set(true)));
///
/// runtime.advance(Duration::from_millis(999));
/// assert!(!fired.get());
/// runtime.advance(Duration::from_millis(1));
/// assert!(fired.get());
/// ```
#[derive(Clone)]
pub struct ManualRuntime {
    inner: Rc<ManualInner>,
}

struct ManualInner {
    now: Cell<Instant>,
    next_timer_id: Cell<u64>,
    timers: RefCell<BTreeMap<(Instant, u64), Box<dyn FnOnce()>>>,
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
}

impl ManualRuntime {
    /// Creates a runtime whose clock starts at the Unix Epoch.
    pub fn new() -> Self {
        Self::starting_at(Instant::default())
    }

    /// Creates a runtime whose clock starts at `now`.
    pub fn starting_at(now: Instant) -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            inner: Rc::new(ManualInner {
                now: Cell::new(now),
                next_timer_id: Cell::new(0),
                timers: RefCell::new(BTreeMap::new()),
                pool: RefCell::new(pool),
                spawner,
            }),
        }
    }

    /// Moves the clock forward, firing due timers in deadline order and running
    /// spawned tasks after each one.
    pub fn advance(&self, by: Duration) {
        let target = self.inner.now.get() + by;
        self.run_until_stalled();

        loop {
            let due = {
                let mut timers = self.inner.timers.borrow_mut();
                let first = timers.keys().next().copied();
                match first {
                    Some(slot) if slot.0 <= target => timers.remove(&slot).map(|cb| (slot.0, cb)),
                    _ => None,
                }
            };

            match due {
                Some((deadline, callback)) => {
                    self.inner.now.set(deadline);
                    callback();
                    self.run_until_stalled();
                }
                None => break,
            }
        }

        self.inner.now.set(target);
        self.run_until_stalled();
    }

    /// Polls spawned tasks until none of them can make progress.
    ///
    /// Must not be called from inside a spawned task.
    pub fn run_until_stalled(&self) {
        self.inner.pool.borrow_mut().run_until_stalled();
    }

    /// Runs `future` to completion, driving spawned tasks alongside it.
    ///
    /// Must not be called from inside a spawned task.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.pool.borrow_mut().run_until(future)
    }

    /// Number of timeouts that are scheduled and not yet fired or cleared.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }
}

impl Default for ManualRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRuntime for ManualRuntime {
    fn now(&self) -> Instant {
        self.inner.now.get()
    }

    fn spawn_local(&self, future: LocalBoxFuture<'static, ()>) {
        if let Err(error) = self.inner.spawner.spawn_local(future) {
            tracing::warn!(%error, "failed to spawn task on manual runtime");
        }
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimeoutHandle {
        let id = self.inner.next_timer_id.get();
        self.inner.next_timer_id.set(id + 1);

        let slot = (self.inner.now.get() + delay, id);
        self.inner.timers.borrow_mut().insert(slot, callback);

        let runtime: Weak<ManualInner> = Rc::downgrade(&self.inner);
        TimeoutHandle::new(move || {
            if let Some(runtime) = runtime.upgrade() {
                runtime.timers.borrow_mut().remove(&slot);
            }
        })
    }
}

impl std::fmt::Debug for ManualRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualRuntime")
            .field("now", &self.inner.now.get())
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}
