// Background tasks owned by one session
use std::future::Future;

use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

/// Named tasks spawned by a session. Everything here is aborted and joined
/// on shutdown; nothing outlives the session.
#[derive(Default)]
pub struct Activities {
    set: JoinSet<&'static str>,
}

impl Activities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(activity = name, "spawned");
        self.set.spawn(async move {
            task.await;
            name
        })
    }

    /// Tasks not yet joined, finished or not.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Waits for the next task to finish. Pending forever when empty, so it
    /// can sit in a `select!` branch guarded by `!is_empty()`.
    pub async fn reap(&mut self) {
        match self.set.join_next().await {
            Some(Ok(name)) => debug!(activity = name, "finished"),
            Some(Err(e)) if e.is_cancelled() => debug!("activity aborted"),
            Some(Err(e)) => warn!(error = %e, "activity panicked"),
            None => std::future::pending::<()>().await,
        }
    }

    /// Aborts and joins everything. Returns the number of tasks still
    /// outstanding afterwards.
    pub async fn shutdown(&mut self) -> usize {
        self.set.abort_all();
        while let Some(res) = self.set.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    warn!(error = %e, "activity panicked during shutdown");
                }
            }
        }
        self.set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_leaves_nothing_running() {
        let mut activities = Activities::new();
        activities.spawn("forever", std::future::pending());
        activities.spawn("sleeper", tokio::time::sleep(Duration::from_secs(3600)));
        assert_eq!(activities.len(), 2);
        assert_eq!(activities.shutdown().await, 0);
        assert!(activities.is_empty());
    }

    #[tokio::test]
    async fn reap_collects_finished_tasks() {
        let mut activities = Activities::new();
        activities.spawn("quick", async {});
        activities.reap().await;
        assert!(activities.is_empty());
    }
}
