//! Heartbeat observer: periodic background agent turns in the main
//! session, with suspend detection and a stale-process sweep before each
//! tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{resolve_user_timezone, AgentConfig};
use crate::core::cli::registry::ProcessRegistry;
use crate::core::notify::Notifier;
use crate::core::quiet::is_quiet_hour;
use crate::errors::CoreResult;

/// Executes one heartbeat turn for a chat. Returns alert text, or None
/// when the agent acknowledged with nothing to say.
#[async_trait]
pub trait HeartbeatHandler: Send + Sync {
    async fn heartbeat(&self, chat_id: i64) -> CoreResult<Option<String>>;
}

pub struct HeartbeatObserver {
    config: Arc<AgentConfig>,
    registry: Arc<ProcessRegistry>,
    handler: Arc<dyn HeartbeatHandler>,
    notifier: Arc<dyn Notifier>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl HeartbeatObserver {
    pub fn new(
        config: Arc<AgentConfig>,
        registry: Arc<ProcessRegistry>,
        handler: Arc<dyn HeartbeatHandler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            registry,
            handler,
            notifier,
            task: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let hb = &self.config.heartbeat;
        if !hb.enabled {
            info!("Heartbeat disabled in config");
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let observer = self.clone();
        let handle = tokio::spawn(async move {
            observer.run_loop().await;
        });
        *self.task.lock().await = Some(handle);
        info!(
            "Heartbeat started (every {}m, quiet {}:00-{}:00)",
            hb.interval_minutes, hb.quiet_start, hb.quiet_end
        );
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        info!("Heartbeat stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.heartbeat.interval_minutes * 60);
        let mut last_wall = SystemTime::now();
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            // Wall-clock gap beyond 2x the interval means the host slept.
            let now_wall = SystemTime::now();
            if let Ok(elapsed) = now_wall.duration_since(last_wall) {
                if elapsed > interval * 2 {
                    warn!(
                        "Wall-clock gap: {:.0}s (expected ~{}s) -- system likely suspended",
                        elapsed.as_secs_f64(),
                        interval.as_secs()
                    );
                }
            }
            last_wall = now_wall;

            if let Err(err) = self.tick().await {
                error!("Heartbeat tick failed (continuing): {err}");
            }
        }
        debug!("Heartbeat loop exited");
    }

    async fn tick(&self) -> CoreResult<()> {
        // Suspend hangovers first: kill anything older than 2x the CLI
        // timeout by wall clock.
        let stale_max = self.config.cli_timeout_secs() * 2;
        let killed = self.registry.kill_stale(stale_max).await;
        if killed > 0 {
            info!("Cleaned up {killed} stale process(es)");
        }

        let hb = &self.config.heartbeat;
        let tz = resolve_user_timezone(&self.config.user_timezone);
        let now_hour = Utc::now().with_timezone(&tz).hour() as u8;
        if is_quiet_hour(now_hour, hb.quiet_start, hb.quiet_end) {
            debug!("Heartbeat skipped: quiet hours ({now_hour}:00 {tz})");
            return Ok(());
        }

        debug!(
            "Heartbeat tick: checking {} chat(s)",
            self.config.allowed_user_ids.len()
        );
        for chat_id in &self.config.allowed_user_ids {
            self.run_for_chat(*chat_id).await;
        }
        Ok(())
    }

    async fn run_for_chat(&self, chat_id: i64) {
        if self.registry.has_active(chat_id) {
            debug!("Heartbeat skipped: chat {chat_id} is busy");
            return;
        }

        let alert = match self.handler.heartbeat(chat_id).await {
            Ok(alert) => alert,
            Err(err) => {
                error!("Heartbeat execution error chat={chat_id}: {err}");
                return;
            }
        };

        if let Some(text) = alert {
            self.notifier.heartbeat_alert(chat_id, &text).await;
        }
    }
}
