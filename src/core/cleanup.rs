//! Cleanup observer: daily removal of aged top-level files from
//! telegram_files and output_to_user. Subdirectories are never touched.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{Timelike, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{resolve_user_timezone, AgentConfig};
use crate::core::paths::TetherPaths;

const CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Delete top-level files older than `max_age_days`. Returns the count
/// deleted. Per-file errors are logged and skipped.
fn delete_old_files(directory: &Path, max_age_days: u64) -> usize {
    if !directory.is_dir() {
        return 0;
    }
    let cutoff = SystemTime::now() - Duration::from_secs(max_age_days * 86_400);
    let Ok(entries) = std::fs::read_dir(directory) else {
        return 0;
    };
    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if old_enough {
            match std::fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(err) => warn!("Failed to delete {}: {err}", path.display()),
            }
        }
    }
    deleted
}

pub struct CleanupObserver {
    config: Arc<AgentConfig>,
    paths: TetherPaths,
    task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    last_run_date: Mutex<String>,
}

impl CleanupObserver {
    pub fn new(config: Arc<AgentConfig>, paths: TetherPaths) -> Self {
        Self {
            config,
            paths,
            task: Mutex::new(None),
            running: AtomicBool::new(false),
            last_run_date: Mutex::new(String::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let cfg = &self.config.cleanup;
        if !cfg.enabled {
            info!("File cleanup disabled in config");
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let observer = self.clone();
        *self.task.lock().await = Some(tokio::spawn(async move {
            observer.run_loop().await;
        }));
        info!(
            "File cleanup started (telegram_files: {}d, output_to_user: {}d, check_hour: {}:00)",
            cfg.telegram_files_days, cfg.output_to_user_days, cfg.check_hour
        );
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        info!("File cleanup stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(CHECK_INTERVAL).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.maybe_run().await {
                error!("Cleanup tick failed (continuing): {err}");
            }
        }
    }

    /// Run when the local hour matches and we have not run today.
    async fn maybe_run(&self) -> crate::errors::CoreResult<()> {
        let tz = resolve_user_timezone(&self.config.user_timezone);
        let now = Utc::now().with_timezone(&tz);
        let today = now.format("%Y-%m-%d").to_string();

        if now.hour() as u8 != self.config.cleanup.check_hour {
            return Ok(());
        }
        {
            let mut last = self.last_run_date.lock().await;
            if *last == today {
                return Ok(());
            }
            *last = today;
        }
        self.execute().await;
        Ok(())
    }

    async fn execute(&self) {
        let telegram_dir = self.paths.telegram_files_dir();
        let output_dir = self.paths.output_to_user_dir();
        let telegram_days = self.config.cleanup.telegram_files_days;
        let output_days = self.config.cleanup.output_to_user_days;

        let (t_deleted, o_deleted) = tokio::task::spawn_blocking(move || {
            (
                delete_old_files(&telegram_dir, telegram_days),
                delete_old_files(&output_dir, output_days),
            )
        })
        .await
        .unwrap_or((0, 0));

        if t_deleted > 0 || o_deleted > 0 {
            info!(
                "Cleanup complete: {t_deleted} file(s) from telegram_files, {o_deleted} from output_to_user"
            );
        } else {
            debug!("Cleanup: nothing to delete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn age_file(path: &Path, days: u64) {
        let old = SystemTime::now() - Duration::from_secs(days * 86_400);
        let secs = old.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs();
        let stamp = chrono::DateTime::<Utc>::from_timestamp(secs as i64, 0)
            .unwrap()
            .format("%Y%m%d%H%M")
            .to_string();
        std::process::Command::new("touch")
            .args(["-t", &stamp, &path.display().to_string()])
            .output()
            .unwrap();
    }

    #[test]
    fn old_files_deleted_subdirs_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let old_file = dir.path().join("old.bin");
        let new_file = dir.path().join("new.bin");
        fs::write(&old_file, b"x").unwrap();
        fs::write(&new_file, b"y").unwrap();
        age_file(&old_file, 40);

        let sub = dir.path().join("2025-01-01");
        fs::create_dir(&sub).unwrap();
        let nested = sub.join("keep.bin");
        fs::write(&nested, b"z").unwrap();

        let deleted = delete_old_files(dir.path(), 30);
        assert_eq!(deleted, 1);
        assert!(!old_file.exists());
        assert!(new_file.exists());
        assert!(nested.exists());
    }

    #[test]
    fn missing_directory_is_noop() {
        assert_eq!(delete_old_files(Path::new("/nonexistent/nowhere"), 30), 0);
    }
}
