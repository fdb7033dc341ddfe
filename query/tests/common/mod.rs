#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use futures_channel::oneshot;
use query_core::{FetchError, QueryFn};

type Responder<V> = oneshot::Sender<Result<V, FetchError>>;

/// A query function whose calls stay pending until the test resolves them, oldest first.
pub struct Controlled<V> {
    pending: Rc<RefCell<VecDeque<Responder<V>>>>,
    calls: Rc<Cell<usize>>,
}

impl<V: 'static> Controlled<V> {
    pub fn new() -> Self {
        Self {
            pending: Rc::new(RefCell::new(VecDeque::new())),
            calls: Rc::new(Cell::new(0)),
        }
    }

    pub fn query_fn(&self) -> QueryFn<V> {
        let pending = self.pending.clone();
        let calls = self.calls.clone();
        query_core::query_fn(move || {
            calls.set(calls.get() + 1);
            let (sender, receiver) = oneshot::channel();
            pending.borrow_mut().push_back(sender);
            async move {
                receiver
                    .await
                    .unwrap_or_else(|_| Err(FetchError::network("request dropped")))
            }
        })
    }

    /// How many times the query function was called.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// How many calls have not been resolved yet.
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Resolves the oldest pending call.
    pub fn resolve(&self, result: Result<V, FetchError>) {
        let responder = self.pending.borrow_mut().pop_front();
        match responder {
            Some(responder) => {
                let _ = responder.send(result);
            }
            None => panic!("no pending call to resolve"),
        }
    }
}
