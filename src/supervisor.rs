//! Supervisor: spawns the bot as a child process and restarts it on
//! request (exit code 42) or crash (exponential backoff up to a cap).

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

pub const EXIT_RESTART: i32 = 42;
const FAST_CRASH_THRESHOLD: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const SIGTERM_TIMEOUT: Duration = Duration::from_secs(10);

async fn run_child() -> Result<i32> {
    let exe = std::env::current_exe()?;
    let mut child = tokio::process::Command::new(exe)
        .arg("run")
        .kill_on_drop(true)
        .spawn()?;
    info!("Child started: pid={:?}", child.id());

    tokio::select! {
        status = child.wait() => {
            Ok(status?.code().unwrap_or(1))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Supervisor interrupted, stopping child");
            terminate_child(&mut child).await;
            Ok(0)
        }
    }
}

async fn terminate_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        use crate::platform::{NativePlatform, Platform};
        let _ = NativePlatform::terminate_process(pid);
        if tokio::time::timeout(SIGTERM_TIMEOUT, child.wait()).await.is_err() {
            warn!("Child did not exit in {}s, force killing", SIGTERM_TIMEOUT.as_secs());
            let _ = child.kill().await;
        }
    }
}

/// Main supervisor loop with crash recovery.
pub async fn supervise() -> Result<()> {
    let mut fast_crash_count: u32 = 0;
    loop {
        info!("Starting bot");
        let started = Instant::now();
        let code = run_child().await?;
        let runtime = started.elapsed();
        info!(
            "Supervisor child exit_code={code} runtime={:.1}s",
            runtime.as_secs_f64()
        );

        if code == 0 {
            info!("Clean shutdown, supervisor exiting");
            return Ok(());
        }
        if code == EXIT_RESTART {
            info!("Restart requested, respawning immediately");
            fast_crash_count = 0;
            continue;
        }

        if runtime < FAST_CRASH_THRESHOLD {
            fast_crash_count += 1;
        } else {
            fast_crash_count = 0;
        }
        let backoff = Duration::from_secs(
            2u64.saturating_pow(fast_crash_count).min(MAX_BACKOFF.as_secs()),
        );
        warn!(
            "Crash detected, restarting in {}s (fast_crashes={fast_crash_count})",
            backoff.as_secs()
        );
        tokio::time::sleep(backoff).await;
    }
}
