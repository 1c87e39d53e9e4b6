//! Per-chat serialization gate: dedupe, abort triggers, quick-command
//! detection, and the pending-message queue behind each chat's lock.
//!
//! Transport-free on purpose; the Telegram layer owns all message sends
//! and indicator edits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// Callback-data prefix for queue cancel buttons.
pub const MQ_PREFIX: &str = "mq:";

const MAX_LOCKS: usize = 1000;
const DEDUP_TTL: Duration = Duration::from_secs(30);
const DEDUP_MAX_SIZE: usize = 200;

/// Bare-word abort triggers, English and German.
const ABORT_WORDS: [&str; 12] = [
    "stop",
    "abort",
    "cancel",
    "halt",
    "wait",
    "quit",
    "exit",
    "interrupt",
    "stopp",
    "warte",
    "abbruch",
    "abbrechen",
];

/// `/stop` exact, or a single bare abort word.
pub fn is_abort_message(text: &str) -> bool {
    let stripped = text.trim();
    if stripped.eq_ignore_ascii_case("/stop") {
        return true;
    }
    let lowered = stripped.to_lowercase();
    if lowered.contains(' ') {
        return false;
    }
    ABORT_WORDS.contains(&lowered.as_str())
}

/// Read-only commands that bypass the per-chat lock. Matches both bare
/// commands and commands with arguments (`/model sonnet`).
const QUICK_COMMANDS: [&str; 6] = [
    "/status",
    "/memory",
    "/cron",
    "/diagnose",
    "/model",
    "/showfiles",
];

pub fn is_quick_command(text: &str) -> bool {
    let first_word = text
        .trim()
        .to_lowercase()
        .split_whitespace()
        .next()
        .map(str::to_string)
        .unwrap_or_default();
    QUICK_COMMANDS.contains(&first_word.as_str())
}

/// In-memory LRU with TTL for message deduplication. Monotonic clock so
/// host clock jumps cannot resurrect old keys.
pub struct DedupeCache {
    entries: HashMap<String, Instant>,
    ttl: Duration,
    max_size: usize,
}

impl DedupeCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_size: max_size.max(1),
        }
    }

    /// True when `key` was already seen within the TTL (duplicate). First
    /// sighting records the key and returns false.
    pub fn check(&mut self, key: &str) -> bool {
        let now = Instant::now();
        if let Some(seen) = self.entries.get(key) {
            if now.duration_since(*seen) < self.ttl {
                self.entries.insert(key.to_string(), now);
                debug!("Dedup hit key={key}");
                return true;
            }
        }
        self.entries.insert(key.to_string(), now);
        self.prune(now);
        false
    }

    fn prune(&mut self, now: Instant) {
        self.entries
            .retain(|_, seen| now.duration_since(*seen) < self.ttl);
        while self.entries.len() > self.max_size {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, seen)| **seen)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// A message waiting behind the per-chat lock.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub entry_id: u64,
    pub origin_message_id: i32,
    pub indicator_message_id: Option<i32>,
    pub cancelled: bool,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<i64, Vec<QueueEntry>>,
}

/// Per-chat mutual exclusion with a visible, cancellable queue.
pub struct ChatGate {
    locks: StdMutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    state: StdMutex<GateState>,
    dedup: StdMutex<DedupeCache>,
    counter: AtomicU64,
}

impl Default for ChatGate {
    fn default() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
            state: StdMutex::new(GateState::default()),
            dedup: StdMutex::new(DedupeCache::new(DEDUP_TTL, DEDUP_MAX_SIZE)),
            counter: AtomicU64::new(0),
        }
    }
}

impl ChatGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-chat lock, created on first use. Also used by webhook wake
    /// dispatch to queue behind active conversations.
    pub fn lock_for(&self, chat_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("gate locks");
        if !locks.contains_key(&chat_id) && locks.len() >= MAX_LOCKS {
            let idle: Vec<i64> = locks
                .iter()
                .filter(|(_, lock)| lock.try_lock().is_ok())
                .map(|(id, _)| *id)
                .collect();
            for id in idle.iter().take(idle.len() / 2) {
                locks.remove(id);
            }
        }
        locks
            .entry(chat_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn has_pending(&self, chat_id: i64) -> bool {
        self.state
            .lock()
            .expect("gate state")
            .pending
            .get(&chat_id)
            .map(|entries| !entries.is_empty())
            .unwrap_or(false)
    }

    /// Lock held or messages waiting.
    pub fn is_busy(&self, chat_id: i64) -> bool {
        let lock_held = {
            let locks = self.locks.lock().expect("gate locks");
            locks
                .get(&chat_id)
                .map(|lock| lock.try_lock().is_err())
                .unwrap_or(false)
        };
        lock_held || self.has_pending(chat_id)
    }

    /// True when `(chat, message)` was already processed recently.
    pub fn is_duplicate(&self, chat_id: i64, message_id: i32) -> bool {
        self.dedup
            .lock()
            .expect("gate dedup")
            .check(&format!("{chat_id}:{message_id}"))
    }

    /// Register a waiting message. Returns the queue entry id the cancel
    /// button is bound to.
    pub fn enqueue(&self, chat_id: i64, origin_message_id: i32) -> u64 {
        let entry_id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = QueueEntry {
            entry_id,
            origin_message_id,
            indicator_message_id: None,
            cancelled: false,
        };
        self.state
            .lock()
            .expect("gate state")
            .pending
            .entry(chat_id)
            .or_default()
            .push(entry);
        entry_id
    }

    pub fn set_indicator(&self, chat_id: i64, entry_id: u64, indicator_message_id: i32) {
        let mut state = self.state.lock().expect("gate state");
        if let Some(entry) = state
            .pending
            .get_mut(&chat_id)
            .and_then(|entries| entries.iter_mut().find(|e| e.entry_id == entry_id))
        {
            entry.indicator_message_id = Some(indicator_message_id);
        }
    }

    /// Remove and return the entry once its turn arrives.
    pub fn take_entry(&self, chat_id: i64, entry_id: u64) -> Option<QueueEntry> {
        let mut state = self.state.lock().expect("gate state");
        let entries = state.pending.get_mut(&chat_id)?;
        let index = entries.iter().position(|e| e.entry_id == entry_id)?;
        let entry = entries.remove(index);
        if entries.is_empty() {
            state.pending.remove(&chat_id);
        }
        Some(entry)
    }

    /// Mark one entry cancelled. Returns its indicator message id so the
    /// caller can edit it; None when the entry is unknown or already
    /// cancelled.
    pub fn cancel_entry(&self, chat_id: i64, entry_id: u64) -> Option<Option<i32>> {
        let mut state = self.state.lock().expect("gate state");
        let entry = state
            .pending
            .get_mut(&chat_id)?
            .iter_mut()
            .find(|e| e.entry_id == entry_id && !e.cancelled)?;
        entry.cancelled = true;
        info!("Queue entry cancelled chat={chat_id} entry={entry_id}");
        Some(entry.indicator_message_id)
    }

    /// Cancel every live entry for a chat. Returns the indicator ids of
    /// the entries just discarded.
    pub fn drain_pending(&self, chat_id: i64) -> Vec<Option<i32>> {
        let mut state = self.state.lock().expect("gate state");
        let mut discarded = Vec::new();
        if let Some(entries) = state.pending.get_mut(&chat_id) {
            for entry in entries.iter_mut().filter(|e| !e.cancelled) {
                entry.cancelled = true;
                discarded.push(entry.indicator_message_id);
            }
        }
        info!("Queue drained chat={chat_id} discarded={}", discarded.len());
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_matches_stop_and_bare_words_only() {
        assert!(is_abort_message("/stop"));
        assert!(is_abort_message("  STOP  "));
        assert!(is_abort_message("abbrechen"));
        assert!(!is_abort_message("stop the deployment"));
        assert!(!is_abort_message("/stop now"));
        assert!(!is_abort_message("please halt everything"));
    }

    #[test]
    fn quick_commands_match_with_and_without_args() {
        assert!(is_quick_command("/status"));
        assert!(is_quick_command("/model sonnet"));
        assert!(!is_quick_command("/new"));
        assert!(!is_quick_command("hello"));
    }

    #[test]
    fn dedupe_flags_repeats_within_ttl() {
        let mut cache = DedupeCache::new(Duration::from_secs(30), 10);
        assert!(!cache.check("1:100"));
        assert!(cache.check("1:100"));
        assert!(!cache.check("1:101"));
    }

    #[test]
    fn dedupe_expires_and_bounds_size() {
        let mut cache = DedupeCache::new(Duration::from_millis(10), 2);
        assert!(!cache.check("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.check("a"), "expired entries are forgotten");

        assert!(!cache.check("b"));
        assert!(!cache.check("c"));
        assert!(!cache.check("d"));
        // Max size 2: the map never grows past the bound.
        assert!(cache.entries.len() <= 2);
    }

    #[test]
    fn queue_entry_lifecycle() {
        let gate = ChatGate::new();
        let entry_id = gate.enqueue(100, 555);
        assert!(gate.has_pending(100));
        gate.set_indicator(100, entry_id, 556);

        // Cancel marks but does not remove.
        assert_eq!(gate.cancel_entry(100, entry_id), Some(Some(556)));
        assert!(gate.has_pending(100));
        // Second cancel is a no-op.
        assert!(gate.cancel_entry(100, entry_id).is_none());

        let entry = gate.take_entry(100, entry_id).unwrap();
        assert!(entry.cancelled);
        assert!(!gate.has_pending(100));
    }

    #[test]
    fn drain_cancels_all_live_entries() {
        let gate = ChatGate::new();
        let a = gate.enqueue(7, 1);
        let b = gate.enqueue(7, 2);
        gate.set_indicator(7, a, 11);
        gate.set_indicator(7, b, 12);
        gate.cancel_entry(7, a);

        let discarded = gate.drain_pending(7);
        // Only b was still live.
        assert_eq!(discarded, vec![Some(12)]);
    }

    #[tokio::test]
    async fn busy_reflects_lock_and_queue() {
        let gate = ChatGate::new();
        assert!(!gate.is_busy(5));
        let lock = gate.lock_for(5);
        let guard = lock.lock().await;
        assert!(gate.is_busy(5));
        drop(guard);
        assert!(!gate.is_busy(5));
        gate.enqueue(5, 9);
        assert!(gate.is_busy(5));
    }
}
