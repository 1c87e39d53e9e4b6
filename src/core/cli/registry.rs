//! Centralized registry of active CLI subprocesses, keyed by chat id.
//!
//! Kill paths signal by pid through the platform layer; the task that
//! spawned the child keeps ownership and reaps it on exit. A per-chat
//! aborted flag is set on any kill and cleared at the next message.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::platform::{NativePlatform, Platform};

const SIGTERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub pid: u32,
    pub chat_id: i64,
    pub label: String,
    /// Wall clock, not monotonic: stale detection must survive host
    /// suspend/resume where monotonic timers stall.
    pub registered_at: SystemTime,
}

#[derive(Debug, Default)]
struct RegistryState {
    processes: HashMap<i64, Vec<TrackedProcess>>,
    aborted: HashSet<i64>,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, chat_id: i64, pid: u32, label: &str) -> TrackedProcess {
        let tracked = TrackedProcess {
            pid,
            chat_id,
            label: label.to_string(),
            registered_at: SystemTime::now(),
        };
        let mut state = self.state.lock().expect("registry lock");
        state.processes.entry(chat_id).or_default().push(tracked.clone());
        debug!("Process registered: chat={} label={} pid={}", chat_id, label, pid);
        tracked
    }

    pub fn unregister(&self, tracked: &TrackedProcess) {
        let mut state = self.state.lock().expect("registry lock");
        if let Some(entries) = state.processes.get_mut(&tracked.chat_id) {
            entries.retain(|p| p.pid != tracked.pid);
            if entries.is_empty() {
                state.processes.remove(&tracked.chat_id);
            }
        }
        debug!(
            "Process unregistered: chat={} label={} pid={}",
            tracked.chat_id, tracked.label, tracked.pid
        );
    }

    /// Kill every active process for a chat and set its aborted flag.
    /// Returns the number of processes signalled.
    pub async fn kill_all(&self, chat_id: i64) -> usize {
        let entries = {
            let mut state = self.state.lock().expect("registry lock");
            state.aborted.insert(chat_id);
            state.processes.remove(&chat_id).unwrap_or_default()
        };
        if entries.is_empty() {
            return 0;
        }
        kill_processes(&entries).await
    }

    pub fn was_aborted(&self, chat_id: i64) -> bool {
        self.state.lock().expect("registry lock").aborted.contains(&chat_id)
    }

    pub fn clear_abort(&self, chat_id: i64) {
        self.state.lock().expect("registry lock").aborted.remove(&chat_id);
    }

    pub fn has_active(&self, chat_id: i64) -> bool {
        self.state
            .lock()
            .expect("registry lock")
            .processes
            .get(&chat_id)
            .map(|entries| !entries.is_empty())
            .unwrap_or(false)
    }

    /// Kill processes older than `max_age` by wall-clock registration time.
    /// Returns the number killed.
    pub async fn kill_stale(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let stale: Vec<TrackedProcess> = {
            let state = self.state.lock().expect("registry lock");
            state
                .processes
                .values()
                .flatten()
                .filter(|tracked| {
                    now.duration_since(tracked.registered_at)
                        .map(|age| age > max_age)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        if stale.is_empty() {
            return 0;
        }
        for tracked in &stale {
            warn!(
                "Stale process: pid={} label={} chat={}",
                tracked.pid, tracked.label, tracked.chat_id
            );
        }
        let killed = kill_processes(&stale).await;
        {
            let mut state = self.state.lock().expect("registry lock");
            for tracked in &stale {
                if let Some(entries) = state.processes.get_mut(&tracked.chat_id) {
                    entries.retain(|p| p.pid != tracked.pid);
                }
            }
            state.processes.retain(|_, entries| !entries.is_empty());
        }
        killed
    }
}

/// Terminate -> grace -> force-kill for each process. The spawning task
/// reaps the child; this only signals.
async fn kill_processes(entries: &[TrackedProcess]) -> usize {
    let mut signalled = 0;
    for tracked in entries {
        if NativePlatform::terminate_process(tracked.pid).is_ok() {
            debug!("Terminate sent: pid={} label={}", tracked.pid, tracked.label);
            signalled += 1;
        }
    }
    if signalled == 0 {
        return 0;
    }
    tokio::time::sleep(SIGTERM_GRACE).await;
    for tracked in entries {
        if let Err(err) = NativePlatform::kill_process_tree(tracked.pid) {
            debug!("Force kill failed pid={}: {}", tracked.pid, err);
        }
    }
    info!("Killed {} CLI process(es)", signalled);
    signalled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_tracks_activity() {
        let registry = ProcessRegistry::new();
        assert!(!registry.has_active(5));
        let tracked = registry.register(5, 4242, "main");
        assert!(registry.has_active(5));
        registry.unregister(&tracked);
        assert!(!registry.has_active(5));
    }

    #[tokio::test]
    async fn abort_flag_set_by_kill_and_cleared_explicitly() {
        let registry = ProcessRegistry::new();
        assert!(!registry.was_aborted(1));
        registry.kill_all(1).await;
        assert!(registry.was_aborted(1));
        registry.clear_abort(1);
        assert!(!registry.was_aborted(1));
    }

    #[tokio::test]
    async fn kill_all_empties_chat_entries() {
        let registry = ProcessRegistry::new();
        // Use our own pid-space-safe fake: spawn a real sleeper.
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid");
        registry.register(2, pid, "main");
        let killed = registry.kill_all(2).await;
        assert_eq!(killed, 1);
        assert!(!registry.has_active(2));
    }

    #[tokio::test]
    async fn kill_stale_ignores_young_processes() {
        let registry = ProcessRegistry::new();
        registry.register(3, 999_999, "main");
        let killed = registry.kill_stale(Duration::from_secs(3600)).await;
        assert_eq!(killed, 0);
        assert!(registry.has_active(3));
    }
}
