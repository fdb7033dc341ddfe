use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};

use crate::{
    query_cache::{CacheInner, QueryCache},
    QueryKey, QueryRuntime, TimeoutHandle,
};

/// Removes an idle query from the cache once its gc time has passed.
pub(crate) struct GarbageCollector {
    key: QueryKey,
    cache: Weak<CacheInner>,
    runtime: Rc<dyn QueryRuntime>,
    gc_time: Cell<Option<Duration>>,
    handle: Rc<RefCell<Option<TimeoutHandle>>>,
}

impl GarbageCollector {
    pub(crate) fn new(
        key: QueryKey,
        cache: Weak<CacheInner>,
        runtime: Rc<dyn QueryRuntime>,
        gc_time: Option<Duration>,
    ) -> Self {
        Self {
            key,
            cache,
            runtime,
            gc_time: Cell::new(gc_time),
            handle: Rc::new(RefCell::new(None)),
        }
    }

    /// Keep max gc time. `None` never collects, so it wins over any duration.
    pub(crate) fn update_gc_time(&self, gc_time: Option<Duration>) {
        match (self.gc_time.get(), gc_time) {
            (Some(current), Some(gc_time)) if gc_time > current => {
                self.gc_time.set(Some(gc_time));
            }
            (Some(_), None) => {
                self.gc_time.set(None);
            }
            _ => {}
        }
    }

    pub(crate) fn gc_time(&self) -> Option<Duration> {
        self.gc_time.get()
    }

    /// Starts the countdown. Does nothing if one is already running.
    pub(crate) fn enable_gc(&self) {
        if self.handle.borrow().is_some() {
            return;
        }

        let Some(gc_time) = self.gc_time.get() else {
            return;
        };

        let key = self.key.clone();
        let cache = self.cache.clone();
        let slot = Rc::downgrade(&self.handle);
        let handle = self.runtime.set_timeout(
            gc_time,
            Box::new(move || {
                // The timer is spent, forget its handle before touching the cache.
                if let Some(slot) = slot.upgrade() {
                    slot.borrow_mut().take();
                }
                if let Some(cache) = cache.upgrade() {
                    QueryCache::from_inner(cache).collect_garbage(&key);
                }
            }),
        );

        tracing::trace!(key = %self.key, gc_time_ms = gc_time.as_millis() as u64, "gc scheduled");
        *self.handle.borrow_mut() = Some(handle);
    }

    /// Cancels a running countdown.
    pub(crate) fn disable_gc(&self) {
        let handle = self.handle.borrow_mut().take();
        if let Some(handle) = handle {
            tracing::trace!(key = %self.key, "gc cancelled");
            handle.clear();
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.handle.borrow().is_some()
    }
}
