//! In-process cron scheduler: watches cron_jobs.json, schedules jobs as
//! single-shot tasks at their next zone-resolved fire instant, and
//! executes them in their task folders.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dependency::DependencyQueue;
use super::execution::{enrich_instruction, run_task_subprocess};
use super::store::{CronJob, CronStore};
use crate::config::{resolve_user_timezone, AgentConfig};
use crate::core::cli::params::{resolve_cli_config, TaskOverrides};
use crate::core::notify::Notifier;
use crate::core::paths::TetherPaths;
use crate::core::quiet::check_quiet_hour;
use crate::errors::{CoreError, CoreResult};

const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Parse a 5-field cron expression. The `cron` crate wants a seconds
/// field, so `M H dom mon dow` becomes `0 M H dom mon dow`.
pub fn parse_schedule(expression: &str) -> CoreResult<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| CoreError::Scheduler(format!("invalid schedule '{expression}': {e}")))
}

/// Next fire instant for `expression` in `tz`, strictly after now.
pub fn next_fire(expression: &str, tz: Tz) -> CoreResult<DateTime<Tz>> {
    let schedule = parse_schedule(expression)?;
    schedule
        .upcoming(tz)
        .next()
        .ok_or_else(|| CoreError::Scheduler(format!("no upcoming fire for '{expression}'")))
}

/// Resolve the zone for a job: entry override -> global config -> host -> UTC.
pub fn resolve_job_timezone(job_timezone: &str, user_timezone: &str) -> Tz {
    if !job_timezone.trim().is_empty() {
        resolve_user_timezone(job_timezone)
    } else {
        resolve_user_timezone(user_timezone)
    }
}

pub struct CronObserver {
    paths: TetherPaths,
    store: Arc<CronStore>,
    config: Arc<AgentConfig>,
    dep_queue: Arc<DependencyQueue>,
    notifier: Arc<dyn Notifier>,
    scheduled: Mutex<HashMap<String, JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    reschedule_lock: Mutex<()>,
    last_mtime: Mutex<Option<std::time::SystemTime>>,
    running: AtomicBool,
}

impl CronObserver {
    pub fn new(
        paths: TetherPaths,
        store: Arc<CronStore>,
        config: Arc<AgentConfig>,
        dep_queue: Arc<DependencyQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            paths,
            store,
            config,
            dep_queue,
            notifier,
            scheduled: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            reschedule_lock: Mutex::new(()),
            last_mtime: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.update_mtime_baseline().await;
        self.schedule_all().await;

        let observer = self.clone();
        let watcher = tokio::spawn(async move {
            observer.watch_loop().await;
        });
        *self.watcher.lock().await = Some(watcher);

        let count = self.scheduled.lock().await.len();
        info!("CronObserver started ({count} jobs scheduled)");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }
        let mut scheduled = self.scheduled.lock().await;
        for (_, handle) in scheduled.drain() {
            handle.abort();
        }
        info!("CronObserver stopped");
    }

    /// Poll the jobs file mtime; on change reload and reschedule everything.
    async fn watch_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(WATCH_INTERVAL).await;
            let Some(current) = self.jobs_file_mtime().await else {
                continue;
            };
            let changed = {
                let mut last = self.last_mtime.lock().await;
                if *last != Some(current) {
                    *last = Some(current);
                    true
                } else {
                    false
                }
            };
            if changed {
                let store = self.store.clone();
                let _ = tokio::task::spawn_blocking(move || store.reload()).await;
                self.reschedule_all().await;
            }
        }
    }

    async fn jobs_file_mtime(&self) -> Option<std::time::SystemTime> {
        let path = self.store.path().clone();
        tokio::task::spawn_blocking(move || std::fs::metadata(&path).ok()?.modified().ok())
            .await
            .ok()
            .flatten()
    }

    /// Refresh the watcher baseline so our own run-status writes do not
    /// trigger a full reschedule of every other job.
    async fn update_mtime_baseline(&self) {
        let current = self.jobs_file_mtime().await;
        *self.last_mtime.lock().await = current;
    }

    async fn schedule_all(self: &Arc<Self>) {
        for job in self.store.list_jobs() {
            if job.enabled {
                self.schedule_job(&job).await;
            }
        }
    }

    async fn reschedule_all(self: &Arc<Self>) {
        let _serialize = self.reschedule_lock.lock().await;
        {
            let mut scheduled = self.scheduled.lock().await;
            for (_, handle) in scheduled.drain() {
                handle.abort();
            }
        }
        self.schedule_all().await;
        let count = self.scheduled.lock().await.len();
        info!("Rescheduled {count} jobs");
    }

    /// Park a task until the job's next fire instant, then keep firing on
    /// schedule until the job disappears or is disabled.
    async fn schedule_job(self: &Arc<Self>, job: &CronJob) {
        let Some(first_delay) = Self::delay_until_next(job, &self.config.user_timezone) else {
            return;
        };

        let observer = self.clone();
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::time::sleep(delay).await;
                if !observer.running.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(err) = observer.execute_job(&job_id).await {
                    error!("Cron job {job_id} failed: {err}");
                }
                if !observer.running.load(Ordering::SeqCst) {
                    return;
                }
                // Re-read the job so helper-tool edits between fires are
                // honored without waiting for the file watcher.
                let Some(job) = observer.store.get_job(&job_id) else {
                    return;
                };
                if !job.enabled {
                    return;
                }
                match Self::delay_until_next(&job, &observer.config.user_timezone) {
                    Some(next_delay) => delay = next_delay,
                    None => return,
                }
            }
        });
        self.scheduled.lock().await.insert(job.id.clone(), handle);
    }

    fn delay_until_next(job: &CronJob, user_timezone: &str) -> Option<Duration> {
        let tz = resolve_job_timezone(&job.timezone, user_timezone);
        match next_fire(&job.schedule, tz) {
            Ok(next) => {
                let delay = (next.with_timezone(&Utc) - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                debug!(
                    "Scheduled {}: next run {} ({}), delay {:.0}s",
                    job.id,
                    next,
                    tz,
                    delay.as_secs_f64()
                );
                Some(delay)
            }
            Err(err) => {
                warn!("Invalid cron expression for job {}: {err}", job.id);
                None
            }
        }
    }

    /// Fire sequence: folder check, then dependency acquire, then quiet
    /// hours. A missing folder must be recorded without ever touching the
    /// shared per-key lock.
    async fn execute_job(self: &Arc<Self>, job_id: &str) -> CoreResult<()> {
        let Some(job) = self.store.get_job(job_id) else {
            return Ok(());
        };
        let job_title = job.title.clone();

        let folder = self.paths.cron_tasks_dir().join(&job.task_folder);
        let folder_exists = {
            let folder = folder.clone();
            tokio::task::spawn_blocking(move || folder.is_dir())
                .await
                .unwrap_or(false)
        };
        if !folder_exists {
            error!("Cron task folder missing: {}", folder.display());
            self.store.update_run_status(job_id, "error:folder_missing")?;
            self.update_mtime_baseline().await;
            return Ok(());
        }

        let _dep = self
            .dep_queue
            .acquire(&job_title, job.dependency.as_deref())
            .await;
        info!("Cron job starting job={job_title}");

        let (is_quiet, now_hour, tz) = check_quiet_hour(
            job.quiet_start,
            job.quiet_end,
            &self.config.user_timezone,
            self.config.heartbeat.quiet_start,
            self.config.heartbeat.quiet_end,
        );
        if is_quiet {
            debug!("Cron job skipped: quiet hours ({now_hour}:00 {tz}) job={job_title}");
            return Ok(());
        }

        let overrides = TaskOverrides {
            provider: job.provider.clone(),
            model: job.model.clone(),
            reasoning_effort: job.reasoning_effort.clone(),
            cli_parameters: job.cli_parameters.clone(),
        };
        let exec_config = resolve_cli_config(&self.config, folder.clone(), &overrides)?;
        let enriched = enrich_instruction(&job.agent_instruction, &job.task_folder);

        let t0 = std::time::Instant::now();
        let outcome = run_task_subprocess(
            &exec_config,
            &enriched,
            &folder,
            self.config.cli_timeout_secs(),
        )
        .await?;

        self.store.update_run_status(job_id, &outcome.status)?;
        self.update_mtime_baseline().await;
        info!(
            "Cron job completed job={} status={} duration_ms={}",
            job_title,
            outcome.status,
            t0.elapsed().as_millis(),
        );

        self.notifier
            .cron_result(&job_title, &outcome.result_text, &outcome.status)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn five_field_expressions_parse() {
        assert!(parse_schedule("0 9 * * *").is_ok());
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("not a schedule").is_err());
    }

    #[test]
    fn next_fire_respects_zone_wall_clock() {
        // "30 9 * * *" in Berlin must land on 09:30 Berlin wall clock.
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let next = next_fire("30 9 * * *", berlin).unwrap();
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn zone_resolution_prefers_job_override() {
        let tz = resolve_job_timezone("Asia/Tokyo", "Europe/Berlin");
        assert_eq!(tz, chrono_tz::Asia::Tokyo);
        let tz = resolve_job_timezone("", "Europe/Berlin");
        assert_eq!(tz, chrono_tz::Europe::Berlin);
    }

    #[test]
    fn schedule_iterates_daily_in_zone() {
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let schedule = parse_schedule("0 4 * * *").unwrap();
        let after = berlin.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut upcoming = schedule.after(&after);
        let first = upcoming.next().unwrap();
        let second = upcoming.next().unwrap();
        assert_eq!(first.hour(), 4);
        assert_eq!((second - first).num_hours(), 24);
    }
}
