//! Cron job definitions and JSON persistence.
//!
//! Jobs live in `cron_jobs.json`; the scheduler watches the file's mtime
//! and reschedules on change, so out-of-band edits by the workspace helper
//! tools are picked up within seconds.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::jsonfs;
use crate::errors::{CoreError, CoreResult};

/// A scheduled job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronJob {
    pub id: String,
    pub title: String,
    pub description: String,
    /// 5-field cron expression, interpreted in the resolved timezone.
    pub schedule: String,
    pub task_folder: String,
    pub agent_instruction: String,
    pub enabled: bool,
    pub timezone: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,

    // Per-task execution overrides.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub cli_parameters: Vec<String>,

    // Quiet hours (None = global heartbeat window).
    pub quiet_start: Option<u8>,
    pub quiet_end: Option<u8>,

    /// Jobs sharing a dependency key run sequentially, FIFO.
    pub dependency: Option<String>,
}

impl Default for CronJob {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            schedule: String::new(),
            task_folder: String::new(),
            agent_instruction: String::new(),
            enabled: true,
            timezone: String::new(),
            created_at: None,
            last_run_at: None,
            last_run_status: None,
            provider: None,
            model: None,
            reasoning_effort: None,
            cli_parameters: Vec::new(),
            quiet_start: None,
            quiet_end: None,
            dependency: None,
        }
    }
}

/// Lowercase, hyphens, digits only. Matches the helper tools' convention.
pub fn sanitize_job_id(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsFile {
    jobs: Vec<CronJob>,
}

/// JSON-backed cron job store. Data only; scheduling lives in the observer.
pub struct CronStore {
    path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
}

impl CronStore {
    pub fn new(path: PathBuf) -> Self {
        let jobs = Self::load_from(&path);
        Self {
            path,
            jobs: Mutex::new(jobs),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn add_job(&self, mut job: CronJob) -> CoreResult<()> {
        job.id = sanitize_job_id(&job.id);
        if job.created_at.is_none() {
            job.created_at = Some(Utc::now());
        }
        let mut jobs = self.jobs.lock().expect("cron store lock");
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(CoreError::Scheduler(format!("job '{}' already exists", job.id)));
        }
        info!("Cron job added: {} ({})", job.id, job.schedule);
        jobs.push(job);
        self.save(&jobs)
    }

    pub fn remove_job(&self, job_id: &str) -> CoreResult<bool> {
        let mut jobs = self.jobs.lock().expect("cron store lock");
        let before = jobs.len();
        jobs.retain(|j| j.id != job_id);
        if jobs.len() == before {
            return Ok(false);
        }
        self.save(&jobs)?;
        info!("Cron job removed: {}", job_id);
        Ok(true)
    }

    pub fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.lock().expect("cron store lock").clone()
    }

    pub fn get_job(&self, job_id: &str) -> Option<CronJob> {
        self.jobs
            .lock()
            .expect("cron store lock")
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    /// Record the outcome of a run.
    pub fn update_run_status(&self, job_id: &str, status: &str) -> CoreResult<()> {
        let mut jobs = self.jobs.lock().expect("cron store lock");
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(());
        };
        job.last_run_at = Some(Utc::now());
        job.last_run_status = Some(status.to_string());
        self.save(&jobs)
    }

    /// Re-read from disk (called by the observer on file change).
    pub fn reload(&self) {
        let fresh = Self::load_from(&self.path);
        *self.jobs.lock().expect("cron store lock") = fresh;
    }

    fn load_from(path: &PathBuf) -> Vec<CronJob> {
        match jsonfs::read_json::<JobsFile>(path) {
            Ok(Some(file)) => file.jobs,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("Corrupt cron jobs file {}: {err}", path.display());
                Vec::new()
            }
        }
    }

    fn save(&self, jobs: &[CronJob]) -> CoreResult<()> {
        let file = JobsFile { jobs: jobs.to_vec() };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| CoreError::Scheduler(format!("serialize jobs: {e}")))?;
        jsonfs::atomic_write(&self.path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> CronJob {
        CronJob {
            id: id.into(),
            title: id.into(),
            schedule: "0 9 * * *".into(),
            task_folder: "demo".into(),
            agent_instruction: "do the thing".into(),
            ..Default::default()
        }
    }

    #[test]
    fn add_list_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron_jobs.json"));
        store.add_job(job("daily-report")).unwrap();
        assert_eq!(store.list_jobs().len(), 1);

        // Duplicate id rejected.
        assert!(store.add_job(job("daily-report")).is_err());

        assert!(store.remove_job("daily-report").unwrap());
        assert!(!store.remove_job("daily-report").unwrap());
    }

    #[test]
    fn reload_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron_jobs.json");
        let store = CronStore::new(path.clone());
        assert!(store.list_jobs().is_empty());

        std::fs::write(
            &path,
            r#"{"jobs":[{"id":"x","title":"x","schedule":"0 * * * *","task_folder":"t","agent_instruction":"i"}]}"#,
        )
        .unwrap();
        store.reload();
        assert_eq!(store.list_jobs().len(), 1);
        assert!(store.get_job("x").unwrap().enabled);
    }

    #[test]
    fn run_status_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron_jobs.json"));
        store.add_job(job("nightly")).unwrap();
        store.update_run_status("nightly", "success").unwrap();

        let reopened = CronStore::new(dir.path().join("cron_jobs.json"));
        let job = reopened.get_job("nightly").unwrap();
        assert_eq!(job.last_run_status.as_deref(), Some("success"));
        assert!(job.last_run_at.is_some());
    }

    #[test]
    fn ids_are_sanitized() {
        assert_eq!(sanitize_job_id("My Daily Report!"), "my-daily-report");
        assert_eq!(sanitize_job_id("  weird__name  "), "weird--name");
    }
}
