//! Tokio task utilities

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// A [`JoinSet`] that admits at most a fixed number of concurrently running tasks.
///
/// [`spawn`](Self::spawn) suspends while the set is at capacity and resumes as
/// running tasks complete. Two independent sets can be nested (a task admitted by
/// one set may spawn into another) without deadlock, because each set hands out
/// its own permits.
pub(crate) struct BoundedJoinSet<T> {
    tasks: JoinSet<T>,
    permits: Arc<Semaphore>,
}

impl<T: Send + 'static> BoundedJoinSet<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Admits and spawns a task, suspending while the set is at capacity.
    pub async fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("the semaphore is never closed");

        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
    }

    /// Waits for every in-flight task to finish.
    ///
    /// Task cancellations are logged and skipped; panics are logged as errors. The
    /// tasks' outputs are discarded, callers aggregate results out of band.
    pub async fn wait(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(_) => continue,
                Err(err) if err.is_cancelled() => {
                    tracing::trace!("task {} was cancelled", err.id());
                }
                Err(err) => {
                    tracing::error!(error = %err, "task {} panicked", err.id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrency_never_exceeds_the_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = BoundedJoinSet::new(3);
        for _ in 0..20 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
        }
        tasks.wait().await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nested_sets_do_not_deadlock() {
        let mut outer = BoundedJoinSet::new(2);
        for _ in 0..4 {
            outer
                .spawn(async {
                    let mut inner = BoundedJoinSet::new(2);
                    for _ in 0..4 {
                        inner.spawn(async {}).await;
                    }
                    inner.wait().await;
                })
                .await;
        }
        outer.wait().await;
    }

    #[tokio::test]
    async fn wait_survives_a_panicking_task() {
        let mut tasks = BoundedJoinSet::new(1);
        tasks.spawn(async { panic!("boom") }).await;
        tasks.spawn(async {}).await;
        tasks.wait().await;
    }
}
