//! Timeout Supervision
//!
//! Runs a step attempt against a deadline. When the deadline passes, the
//! attempt future is dropped and every cleanup the step registered runs
//! (most recent first) before control returns to the caller.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

type Cleanup = Box<dyn FnOnce() + Send>;

/// Cleanup closures registered by a running step attempt.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<Vec<Cleanup>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cleanup: impl FnOnce() + Send + 'static) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.push(Box::new(cleanup));
        }
    }

    /// Runs and clears every registered cleanup, last registered first.
    pub fn run_all(&self) -> usize {
        let cleanups: Vec<Cleanup> = match self.inner.lock() {
            Ok(mut inner) => inner.drain(..).collect(),
            Err(_) => return 0,
        };
        let count = cleanups.len();
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
        count
    }

    /// Drops registered cleanups without running them.
    pub fn discard(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupRegistry").field("pending", &self.len()).finish()
    }
}

/// Result of a supervised attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Deadline<T> {
    Completed(T),
    Expired,
}

/// Enforces one deadline per attempt.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSupervisor {
    limit: Duration,
}

impl TimeoutSupervisor {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Awaits `attempt` for at most the configured limit.
    ///
    /// On completion the cleanups are discarded; on expiry they run before
    /// this returns.
    pub async fn supervise<F>(&self, cleanup: &CleanupRegistry, attempt: F) -> Deadline<F::Output>
    where
        F: Future,
    {
        match tokio::time::timeout(self.limit, attempt).await {
            Ok(output) => {
                cleanup.discard();
                Deadline::Completed(output)
            }
            Err(_) => {
                let ran = cleanup.run_all();
                warn!("Attempt exceeded {:?}; ran {} cleanup(s)", self.limit, ran);
                Deadline::Expired
            }
        }
    }

    /// Runs cleanups for an attempt abandoned for another reason (cancellation).
    pub fn abandon(&self, cleanup: &CleanupRegistry) {
        let ran = cleanup.run_all();
        if ran > 0 {
            debug!("Abandoned attempt ran {} cleanup(s)", ran);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_deadline() {
        let supervisor = TimeoutSupervisor::from_secs(5);
        let cleanup = CleanupRegistry::new();
        cleanup.register(|| panic!("must not run"));

        let result = supervisor
            .supervise(&cleanup, async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                7
            })
            .await;

        assert_eq!(result, Deadline::Completed(7));
        assert!(cleanup.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_runs_cleanup_in_reverse() {
        let supervisor = TimeoutSupervisor::from_secs(1);
        let cleanup = CleanupRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let attempt = {
            let cleanup = cleanup.clone();
            let order = Arc::clone(&order);
            async move {
                for i in 0..3 {
                    let order = Arc::clone(&order);
                    cleanup.register(move || order.lock().unwrap().push(i));
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        };

        let result = supervisor.supervise(&cleanup, attempt).await;
        assert_eq!(result, Deadline::Expired);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_run_all_clears() {
        let cleanup = CleanupRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            cleanup.register(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(cleanup.run_all(), 2);
        assert_eq!(cleanup.run_all(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
