//! Session lifecycle: creation, freshness checks, reset, JSON persistence.
//!
//! One envelope per chat. Provider-local state lives in per-provider buckets
//! so switching providers never erases the other side's resume id or
//! metrics.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{resolve_user_timezone, AgentConfig};
use crate::core::jsonfs;
use crate::errors::CoreResult;

/// Provider-local session state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSession {
    pub session_id: String,
    pub message_count: u64,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
}

/// Active session state for one chat, with provider-isolated buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionData {
    pub chat_id: i64,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub provider_sessions: HashMap<String, ProviderSession>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            chat_id: 0,
            provider: "claude".into(),
            model: "opus".into(),
            created_at: Utc::now(),
            last_active: Utc::now(),
            provider_sessions: HashMap::new(),
        }
    }
}

impl SessionData {
    pub fn new(chat_id: i64, provider: &str, model: &str) -> Self {
        Self {
            chat_id,
            provider: provider.to_string(),
            model: model.to_string(),
            ..Self::default()
        }
    }

    fn bucket(&self) -> Option<&ProviderSession> {
        self.provider_sessions.get(&self.provider)
    }

    fn bucket_mut(&mut self) -> &mut ProviderSession {
        self.provider_sessions.entry(self.provider.clone()).or_default()
    }

    /// Resume id for the currently active provider ("" when fresh).
    pub fn session_id(&self) -> &str {
        self.bucket().map(|b| b.session_id.as_str()).unwrap_or("")
    }

    pub fn set_session_id(&mut self, session_id: &str) {
        self.bucket_mut().session_id = session_id.to_string();
    }

    pub fn message_count(&self) -> u64 {
        self.bucket().map(|b| b.message_count).unwrap_or(0)
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.bucket().map(|b| b.total_cost_usd).unwrap_or(0.0)
    }

    pub fn total_tokens(&self) -> u64 {
        self.bucket().map(|b| b.total_tokens).unwrap_or(0)
    }

    pub fn clear_provider_session(&mut self, provider: &str) {
        self.provider_sessions.remove(provider);
    }
}

/// Merge provider buckets so a stale in-memory snapshot can never regress
/// counters: non-empty session ids win, metrics take the per-metric max.
fn merge_provider_sessions(current: &mut SessionData, incoming: &SessionData) {
    for (provider, data) in &incoming.provider_sessions {
        match current.provider_sessions.get_mut(provider) {
            None => {
                current.provider_sessions.insert(provider.clone(), data.clone());
            }
            Some(existing) => {
                if !data.session_id.is_empty() {
                    existing.session_id = data.session_id.clone();
                }
                existing.message_count = existing.message_count.max(data.message_count);
                existing.total_cost_usd = existing.total_cost_usd.max(data.total_cost_usd);
                existing.total_tokens = existing.total_tokens.max(data.total_tokens);
            }
        }
    }
}

/// Session store: single writer, JSON persistence via atomic replace.
pub struct SessionStore {
    path: PathBuf,
    config: Arc<AgentConfig>,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: PathBuf, config: Arc<AgentConfig>) -> Self {
        Self {
            path,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Returns `(session, is_new_call)`. Reuses a fresh envelope, creates a
    /// new one when stale. `is_new_call` also covers an empty session id on
    /// the active provider's bucket.
    pub async fn resolve_session(
        &self,
        chat_id: i64,
        provider: &str,
        model: &str,
    ) -> CoreResult<(SessionData, bool)> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let key = chat_id.to_string();

        if let Some(existing) = sessions.get_mut(&key) {
            if self.is_fresh(existing) {
                let mut changed = false;
                if existing.provider != provider {
                    info!("Provider switch {} -> {}", existing.provider, provider);
                    existing.provider = provider.to_string();
                    changed = true;
                }
                if existing.model != model {
                    existing.model = model.to_string();
                    changed = true;
                }
                let snapshot = existing.clone();
                if changed {
                    self.save(&sessions).await?;
                }
                let is_new = snapshot.session_id().is_empty();
                return Ok((snapshot, is_new));
            }
        }

        let fresh = SessionData::new(chat_id, provider, model);
        sessions.insert(key, fresh.clone());
        self.save(&sessions).await?;
        info!("Session created provider={} model={}", provider, model);
        Ok((fresh, true))
    }

    /// Read-only lookup; never creates.
    pub async fn get_active(&self, chat_id: i64) -> Option<SessionData> {
        let _guard = self.lock.lock().await;
        self.load().await.get(&chat_id.to_string()).cloned()
    }

    /// Force a new envelope (resume id filled in by the CLI on first call).
    pub async fn reset_session(
        &self,
        chat_id: i64,
        provider: &str,
        model: &str,
    ) -> CoreResult<SessionData> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let fresh = SessionData::new(chat_id, provider, model);
        sessions.insert(chat_id.to_string(), fresh.clone());
        self.save(&sessions).await?;
        info!("Session reset chat={chat_id}");
        Ok(fresh)
    }

    /// Clear only one provider's bucket, keeping every other bucket intact.
    pub async fn reset_provider_session(
        &self,
        chat_id: i64,
        provider: &str,
        model: &str,
    ) -> CoreResult<SessionData> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let key = chat_id.to_string();
        let entry = sessions
            .entry(key)
            .or_insert_with(|| SessionData::new(chat_id, provider, model));
        entry.clear_provider_session(provider);
        entry.provider = provider.to_string();
        entry.model = model.to_string();
        entry.last_active = Utc::now();
        let snapshot = entry.clone();
        self.save(&sessions).await?;
        info!("Provider session reset provider={provider} model={model}");
        Ok(snapshot)
    }

    /// Persist metrics for a completed call and refresh the caller's copy
    /// with the merged aggregates.
    pub async fn update_session(
        &self,
        session: &mut SessionData,
        cost_usd: f64,
        tokens: u64,
    ) -> CoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let key = session.chat_id.to_string();

        let current = sessions.entry(key).or_insert_with(|| session.clone());
        merge_provider_sessions(current, session);
        current.provider = session.provider.clone();
        current.model = session.model.clone();
        current.last_active = Utc::now();
        {
            let bucket = current.bucket_mut();
            bucket.message_count += 1;
            bucket.total_cost_usd += cost_usd;
            bucket.total_tokens += tokens;
        }
        *session = current.clone();
        self.save(&sessions).await
    }

    /// Persist a provider/model change without touching activity counters.
    pub async fn sync_session_target(
        &self,
        session: &mut SessionData,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> CoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let key = session.chat_id.to_string();
        let Some(current) = sessions.get_mut(&key) else {
            return Ok(());
        };

        let mut changed = false;
        if let Some(provider) = provider {
            if current.provider != provider {
                current.provider = provider.to_string();
                changed = true;
            }
        }
        if let Some(model) = model {
            if current.model != model {
                current.model = model.to_string();
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }

        session.provider = current.provider.clone();
        session.model = current.model.clone();
        let snapshot = sessions.clone();
        self.save(&snapshot).await
    }

    fn is_fresh(&self, session: &SessionData) -> bool {
        let now = Utc::now();

        if let Some(max_messages) = self.config.max_session_messages {
            if session.message_count() >= max_messages {
                debug!("Session fresh check: fresh=no reason=max_messages");
                return false;
            }
        }

        let timeout_minutes = self.config.idle_timeout_minutes;
        if timeout_minutes > 0 {
            let idle = now - session.last_active;
            if idle >= Duration::minutes(timeout_minutes as i64) {
                debug!("Session fresh check: fresh=no reason=idle_timeout");
                return false;
            }
        }

        if self.config.daily_reset_enabled && self.crossed_daily_reset(session, now) {
            debug!("Session fresh check: fresh=no reason=daily_reset");
            return false;
        }

        debug!("Session fresh check: fresh=yes");
        true
    }

    /// True when the session's last activity predates the most recent
    /// daily-reset boundary in the user's zone.
    fn crossed_daily_reset(&self, session: &SessionData, now: DateTime<Utc>) -> bool {
        let tz = resolve_user_timezone(&self.config.user_timezone);
        let reset_hour = self.config.daily_reset_hour.min(23) as u32;
        let now_local = now.with_timezone(&tz);
        let last_local = session.last_active.with_timezone(&tz);

        let today_reset = match tz
            .with_ymd_and_hms(
                now_local.date_naive().year(),
                now_local.date_naive().month(),
                now_local.date_naive().day(),
                reset_hour,
                0,
                0,
            )
            .single()
        {
            Some(dt) => dt,
            None => return false,
        };

        if now_local >= today_reset {
            last_local < today_reset
        } else {
            last_local < today_reset - Duration::days(1)
        }
    }

    async fn load(&self) -> HashMap<String, SessionData> {
        let path = self.path.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            jsonfs::read_json::<HashMap<String, SessionData>>(&path)
        })
        .await;
        match loaded {
            Ok(Ok(Some(sessions))) => sessions,
            Ok(Ok(None)) => HashMap::new(),
            Ok(Err(err)) => {
                warn!("Corrupt sessions file, starting fresh: {err}");
                HashMap::new()
            }
            Err(err) => {
                warn!("Session load task failed: {err}");
                HashMap::new()
            }
        }
    }

    async fn save(&self, sessions: &HashMap<String, SessionData>) -> CoreResult<()> {
        let content = serde_json::to_string_pretty(sessions)?;
        jsonfs::atomic_write_async(self.path.clone(), content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        let config = Arc::new(AgentConfig::default());
        SessionStore::new(dir.path().join("sessions.json"), config)
    }

    #[tokio::test]
    async fn resolve_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let (session, is_new) = store.resolve_session(100, "claude", "opus").await.unwrap();
        assert!(is_new);
        assert_eq!(session.session_id(), "");

        let (mut session, _) = store.resolve_session(100, "claude", "opus").await.unwrap();
        session.set_session_id("sid-1");
        store.update_session(&mut session, 0.01, 50).await.unwrap();

        let (session, is_new) = store.resolve_session(100, "claude", "opus").await.unwrap();
        assert!(!is_new);
        assert_eq!(session.session_id(), "sid-1");
        assert_eq!(session.message_count(), 1);
    }

    #[tokio::test]
    async fn provider_switch_keeps_both_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let (mut session, _) = store.resolve_session(7, "claude", "opus").await.unwrap();
        session.set_session_id("claude-sid");
        store.update_session(&mut session, 0.5, 100).await.unwrap();

        let (mut session, is_new) = store
            .resolve_session(7, "codex", "gpt-5.2-codex")
            .await
            .unwrap();
        assert!(is_new, "codex bucket has no session id yet");
        session.set_session_id("codex-sid");
        store.update_session(&mut session, 0.2, 40).await.unwrap();

        let (session, is_new) = store.resolve_session(7, "claude", "opus").await.unwrap();
        assert!(!is_new);
        assert_eq!(session.session_id(), "claude-sid");
        assert_eq!(session.message_count(), 1);
        assert_eq!(session.provider_sessions["codex"].session_id, "codex-sid");
    }

    #[tokio::test]
    async fn reset_provider_clears_only_one_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let (mut session, _) = store.resolve_session(9, "claude", "opus").await.unwrap();
        session.set_session_id("c1");
        store.update_session(&mut session, 0.0, 0).await.unwrap();
        let (mut session, _) = store
            .resolve_session(9, "codex", "gpt-5.2-codex")
            .await
            .unwrap();
        session.set_session_id("x1");
        store.update_session(&mut session, 0.0, 0).await.unwrap();

        store.reset_provider_session(9, "codex", "gpt-5.2-codex").await.unwrap();
        let session = store.get_active(9).await.unwrap();
        assert!(!session.provider_sessions.contains_key("codex"));
        assert_eq!(session.provider_sessions["claude"].session_id, "c1");
    }

    #[tokio::test]
    async fn stale_snapshot_never_regresses_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let (mut early_snapshot, _) = store.resolve_session(3, "claude", "opus").await.unwrap();
        early_snapshot.set_session_id("sid");

        // Another flow records two messages while we hold a stale snapshot.
        let (mut other, _) = store.resolve_session(3, "claude", "opus").await.unwrap();
        other.set_session_id("sid");
        store.update_session(&mut other, 0.1, 10).await.unwrap();
        store.update_session(&mut other, 0.1, 10).await.unwrap();

        store.update_session(&mut early_snapshot, 0.1, 10).await.unwrap();
        assert_eq!(early_snapshot.message_count(), 3);
        assert_eq!(early_snapshot.total_tokens(), 30);
    }

    #[tokio::test]
    async fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sessions.json"), "not json{{").unwrap();
        let store = store(&dir);
        let (_, is_new) = store.resolve_session(1, "claude", "opus").await.unwrap();
        assert!(is_new);
    }
}
