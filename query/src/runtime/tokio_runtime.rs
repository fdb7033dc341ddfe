use std::time::Duration;

use futures::future::LocalBoxFuture;

use super::{QueryRuntime, TimeoutHandle};
use crate::Instant;

/// Runtime backed by tokio's local task set.
///
/// All methods must be called from within a [`tokio::task::LocalSet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRuntime;

impl QueryRuntime for TokioRuntime {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn spawn_local(&self, future: LocalBoxFuture<'static, ()>) {
        tokio::task::spawn_local(future);
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimeoutHandle {
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimeoutHandle::new(move || task.abort())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    #[tokio::test]
    async fn timeout_fires_unless_cleared() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let runtime = TokioRuntime;
                let fired = Rc::new(Cell::new(0));

                let kept = fired.clone();
                let _keep = runtime.set_timeout(
                    Duration::from_millis(5),
                    Box::new(move || kept.set(kept.get() + 1)),
                );

                let cleared = fired.clone();
                runtime
                    .set_timeout(
                        Duration::from_millis(5),
                        Box::new(move || cleared.set(cleared.get() + 10)),
                    )
                    .clear();

                tokio::time::sleep(Duration::from_millis(30)).await;
                assert_eq!(fired.get(), 1);
            })
            .await;
    }
}
