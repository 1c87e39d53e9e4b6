//! Shared subprocess plumbing for the provider wrappers: spawn with piped
//! stdio, pump the event stream with a wall-clock timeout, collect output.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::StreamEvent;
use super::registry::ProcessRegistry;
use crate::core::textutil::truncate_lossy;
use crate::errors::{CoreError, CoreResult};
use crate::platform::{NativePlatform, Platform};

const STREAM_CHANNEL_CAPACITY: usize = 256;
pub const STDERR_CAP: usize = 2000;

/// Locate a binary on PATH.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{binary}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

pub struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
}

/// Spawn with piped stdio; optionally feed the prompt via stdin (Windows
/// argv mangling defense).
pub async fn spawn_piped(
    program: &PathBuf,
    args: &[String],
    working_dir: &PathBuf,
    stdin_payload: Option<&str>,
) -> CoreResult<SpawnedChild> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| CoreError::Cli(format!("spawn {}: {e}", program.display())))?;
    let pid = child
        .id()
        .ok_or_else(|| CoreError::Cli("child exited before pid was read".into()))?;
    info!("CLI subprocess starting pid={pid}");

    if let Some(payload) = stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = payload.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&bytes).await {
                    debug!("stdin write failed: {err}");
                }
                // Drop closes the pipe so the child sees EOF.
            });
        }
    }

    Ok(SpawnedChild { child, pid })
}

pub struct CompletedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub returncode: Option<i32>,
    pub timed_out: bool,
}

/// Wait for the child with a wall-clock timeout, killing the tree on
/// expiry. Registers/unregisters with the process registry around the wait.
pub async fn communicate(
    mut spawned: SpawnedChild,
    timeout: Option<Duration>,
    registry: &Arc<ProcessRegistry>,
    chat_id: i64,
    label: &str,
) -> CompletedOutput {
    let tracked = registry.register(chat_id, spawned.pid, label);

    let wait = async {
        let output = collect_output(&mut spawned.child).await;
        let status = spawned.child.wait().await.ok();
        (output, status.and_then(|s| s.code()))
    };

    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
        None => Some(wait.await),
    };

    let completed = match result {
        Some(((stdout, stderr), code)) => CompletedOutput {
            stdout,
            stderr,
            returncode: code,
            timed_out: false,
        },
        None => {
            warn!("CLI timed out, killing process tree pid={}", spawned.pid);
            let _ = NativePlatform::kill_process_tree(spawned.pid);
            let _ = spawned.child.wait().await;
            CompletedOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                returncode: None,
                timed_out: true,
            }
        }
    };

    registry.unregister(&tracked);
    completed
}

async fn collect_output(child: &mut Child) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let out = child.stdout.take();
    let err = child.stderr.take();
    // Drain both pipes concurrently so a chatty stderr cannot stall the
    // child on a full pipe buffer.
    tokio::join!(
        async {
            if let Some(mut out) = out {
                let _ = out.read_to_end(&mut stdout).await;
            }
        },
        async {
            if let Some(mut err) = err {
                let _ = err.read_to_end(&mut stderr).await;
            }
        }
    );
    (stdout, stderr)
}

/// What the stream pump observed, for providers to build their final event.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub saw_result: bool,
    pub session_id: Option<String>,
    pub accumulated: String,
}

/// Read the child's stdout line by line, parse each line with `parser`,
/// and forward events into `tx`. Tracks session id / accumulated text so
/// the caller can synthesize a result when the stream ends without one.
pub async fn pump_stream<F>(
    mut spawned: SpawnedChild,
    timeout: Option<Duration>,
    registry: &Arc<ProcessRegistry>,
    chat_id: i64,
    label: &str,
    parser: F,
    tx: &mpsc::Sender<StreamEvent>,
) -> StreamOutcome
where
    F: Fn(&str) -> Vec<StreamEvent>,
{
    let tracked = registry.register(chat_id, spawned.pid, label);
    let mut outcome = StreamOutcome::default();

    let stdout = spawned.child.stdout.take();
    let stderr = spawned.child.stderr.take();
    let stderr_drain = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_end(&mut buf).await;
        }
        buf
    });

    let deadline = timeout.map(|limit| tokio::time::Instant::now() + limit);

    if let Some(stdout) = stdout {
        let mut lines = BufReader::with_capacity(4 * 1024 * 1024, stdout).lines();
        loop {
            let next = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, lines.next_line()).await {
                        Ok(read) => read,
                        Err(_) => {
                            outcome.timed_out = true;
                            break;
                        }
                    }
                }
                None => lines.next_line().await,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    debug!("Stream read error: {err}");
                    break;
                }
            };

            debug!("Stream line: {:.120}", line);
            let mut receiver_gone = false;
            for event in parser(&line) {
                match &event {
                    StreamEvent::SystemInit { session_id } => {
                        if outcome.session_id.is_none() {
                            outcome.session_id = session_id.clone();
                        }
                    }
                    StreamEvent::TextDelta { text } => outcome.accumulated.push_str(text),
                    StreamEvent::Result(result) => {
                        outcome.saw_result = true;
                        if outcome.session_id.is_none() {
                            outcome.session_id = result.session_id.clone();
                        }
                    }
                    _ => {}
                }
                if tx.send(event).await.is_err() {
                    // Receiver hung up (abort); stop reading.
                    receiver_gone = true;
                    break;
                }
            }
            if receiver_gone {
                break;
            }
        }
    }

    if outcome.timed_out {
        warn!("CLI stream timed out, killing process tree pid={}", spawned.pid);
        let _ = NativePlatform::kill_process_tree(spawned.pid);
    }
    let _ = spawned.child.wait().await.map(|status| {
        outcome.exit_code = status.code();
    });

    if let Ok(stderr_bytes) = stderr_drain.await {
        let mut text = String::from_utf8_lossy(&stderr_bytes).to_string();
        truncate_lossy(&mut text, STDERR_CAP);
        outcome.stderr = text;
    }

    registry.unregister(&tracked);
    outcome
}

pub fn stream_channel() -> (mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>) {
    mpsc::channel(STREAM_CHANNEL_CAPACITY)
}
