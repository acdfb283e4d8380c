use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Tracks the pool of spawned asynchronous listener tasks so shutdown can
/// drain them.
pub(crate) struct TaskGroup {
    active: AtomicUsize,
    idle: Notify,
}

impl TaskGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(TaskGroup {
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn spawn<F>(self: &Arc<Self>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tracker = Arc::clone(self);
        tracker.active.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            future.await;
            if tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
                tracker.idle.notify_waiters();
            }
        });
    }

    /// Wait until every spawned task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_empty() {
        let tasks = TaskGroup::new();
        tasks.wait_idle().await;
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_tasks_finish() {
        let tasks = TaskGroup::new();
        let flag = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let flag = Arc::clone(&flag);
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::timeout(Duration::from_secs(1), tasks.wait_idle())
            .await
            .unwrap();
        assert_eq!(flag.load(Ordering::SeqCst), 3);
    }
}
