//! Dependency-based serialization for cron jobs and webhook tasks.
//!
//! Tasks sharing a dependency key run sequentially in FIFO order; tasks
//! with different keys (or none) run in parallel. tokio's mutex wakes
//! waiters in acquisition order, which gives the FIFO guarantee.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

#[derive(Default)]
pub struct DependencyQueue {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of a dependent task's execution.
pub struct DependencyGuard {
    _guard: Option<OwnedMutexGuard<()>>,
    label: String,
    dependency: Option<String>,
}

impl Drop for DependencyGuard {
    fn drop(&mut self) {
        if let Some(dependency) = &self.dependency {
            info!(
                "Task released dependency: task={} dependency={}",
                self.label, dependency
            );
        }
    }
}

impl DependencyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `dependency` (waiting FIFO behind holders) and
    /// return a guard that releases on drop. `None` acquires nothing.
    pub async fn acquire(&self, label: &str, dependency: Option<&str>) -> DependencyGuard {
        let Some(dependency) = dependency else {
            debug!("Task executing without dependency: {label}");
            return DependencyGuard {
                _guard: None,
                label: label.to_string(),
                dependency: None,
            };
        };

        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(dependency.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        debug!("Task queued: task={label} dependency={dependency}");
        let guard = lock.lock_owned().await;
        info!("Task acquired dependency: task={label} dependency={dependency}");
        DependencyGuard {
            _guard: Some(guard),
            label: label.to_string(),
            dependency: Some(dependency.to_string()),
        }
    }

    pub async fn known_dependencies(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.locks.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes_in_fifo_order() {
        let queue = Arc::new(DependencyQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            let order = order.clone();
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                // Stagger the acquisitions so arrival order is deterministic.
                tokio::time::sleep(Duration::from_millis(i as u64 * 20)).await;
                let _guard = queue.acquire(&format!("task-{i}"), Some("k")).await;
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0, "overlap detected");
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                order.lock().await.push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn different_keys_run_in_parallel() {
        let queue = Arc::new(DependencyQueue::new());
        let first = queue.acquire("a", Some("k1")).await;
        // With a distinct key this must not block behind `first`.
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            queue.acquire("b", Some("k2")),
        )
        .await;
        assert!(second.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn no_dependency_never_blocks() {
        let queue = DependencyQueue::new();
        let _held = queue.acquire("a", Some("k")).await;
        let free = tokio::time::timeout(Duration::from_millis(50), queue.acquire("b", None)).await;
        assert!(free.is_ok());
    }
}
