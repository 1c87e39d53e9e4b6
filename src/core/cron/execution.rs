//! One-shot CLI command building and output parsing for task execution.
//!
//! Used by both cron fires and webhook task-mode dispatches.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::cli::codex_events::parse_codex_jsonl;
use crate::core::cli::params::TaskExecutionConfig;
use crate::core::textutil::truncate_lossy;
use crate::errors::{CoreError, CoreResult};
use crate::platform::{NativePlatform, Platform};

/// Find the provider binary on PATH; None means `cli_not_found`.
fn find_cli(provider: &str) -> Option<PathBuf> {
    let binary = if provider == "codex" { "codex" } else { "claude" };
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

/// Append the per-task memory-file contract to the instruction.
pub fn enrich_instruction(instruction: &str, task_folder: &str) -> String {
    let memory_file = format!("{task_folder}_MEMORY.md");
    format!(
        "{instruction}\n\nIMPORTANT:\n- Read the {memory_file} file (it contains important information!)\n- When finished, update {memory_file} with DATE + TIME and what you have done."
    )
}

/// Build the full one-shot command line for the resolved provider.
/// Returns None when the provider binary is missing.
pub fn build_cmd(exec_config: &TaskExecutionConfig, prompt: &str) -> Option<(PathBuf, Vec<String>)> {
    let cli = find_cli(&exec_config.provider)?;
    let args = if exec_config.provider == "codex" {
        build_codex_args(exec_config, prompt)
    } else {
        build_claude_args(exec_config, prompt)
    };
    Some((cli, args))
}

fn build_claude_args(exec_config: &TaskExecutionConfig, prompt: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-p".into(),
        "--output-format".into(),
        "json".into(),
        "--model".into(),
        exec_config.model.clone(),
        "--permission-mode".into(),
        exec_config.permission_mode.clone(),
        "--no-session-persistence".into(),
    ];
    args.extend(exec_config.cli_parameters.iter().cloned());
    args.push("--".into());
    args.push(prompt.to_string());
    args
}

fn build_codex_args(exec_config: &TaskExecutionConfig, prompt: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "exec".into(),
        "--json".into(),
        "--color".into(),
        "never".into(),
        "--skip-git-repo-check".into(),
    ];
    if exec_config.permission_mode == "bypassPermissions" {
        args.push("--dangerously-bypass-approvals-and-sandbox".into());
    } else {
        args.push("--full-auto".into());
    }
    args.extend(["--model".into(), exec_config.model.clone()]);
    if !exec_config.reasoning_effort.is_empty() && exec_config.reasoning_effort != "medium" {
        args.extend([
            "-c".into(),
            format!("model_reasoning_effort={}", exec_config.reasoning_effort),
        ]);
    }
    args.extend(exec_config.cli_parameters.iter().cloned());
    args.push("--".into());
    args.push(prompt.to_string());
    args
}

/// Extract result text from claude CLI JSON output.
pub fn parse_claude_result(stdout: &[u8]) -> String {
    let raw = String::from_utf8_lossy(stdout).trim().to_string();
    if raw.is_empty() {
        return String::new();
    }
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(data) => data
            .get("result")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Err(_) => {
            let mut fallback = raw;
            truncate_lossy(&mut fallback, 2000);
            fallback
        }
    }
}

/// Extract result text from codex CLI JSONL output.
pub fn parse_codex_result(stdout: &[u8]) -> String {
    let raw = String::from_utf8_lossy(stdout).trim().to_string();
    if raw.is_empty() {
        return String::new();
    }
    let (text, _, _) = parse_codex_jsonl(&raw);
    if text.is_empty() {
        let mut fallback = raw;
        truncate_lossy(&mut fallback, 2000);
        fallback
    } else {
        text
    }
}

pub struct TaskRunOutcome {
    pub result_text: String,
    pub status: String,
}

/// Spawn the one-shot subprocess in `folder` and parse its output.
/// Status strings follow the documented set: `success`,
/// `error:cli_not_found_<provider>`, `error:timeout`, `error:exit_<code>`.
pub async fn run_task_subprocess(
    exec_config: &TaskExecutionConfig,
    prompt: &str,
    folder: &PathBuf,
    timeout: Duration,
) -> CoreResult<TaskRunOutcome> {
    let Some((cli, args)) = build_cmd(exec_config, prompt) else {
        return Ok(TaskRunOutcome {
            result_text: String::new(),
            status: format!("error:cli_not_found_{}", exec_config.provider),
        });
    };

    debug!(
        "Task subprocess cmd={} cwd={} provider={} model={} timeout={:.0}s",
        cli.display(),
        folder.display(),
        exec_config.provider,
        exec_config.model,
        timeout.as_secs_f64(),
    );

    let mut child = Command::new(&cli)
        .args(&args)
        .current_dir(folder)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CoreError::Cli(format!("spawn {}: {e}", cli.display())))?;
    let pid = child.id();

    let wait = child.wait_with_output();
    let output = match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(CoreError::Cli(format!("subprocess wait: {err}"))),
        Err(_) => {
            warn!("Task timed out after {:.0}s, killing process", timeout.as_secs_f64());
            if let Some(pid) = pid {
                let _ = NativePlatform::kill_process_tree(pid);
            }
            return Ok(TaskRunOutcome {
                result_text: format!("[Task timed out after {:.0}s]", timeout.as_secs_f64()),
                status: "error:timeout".into(),
            });
        }
    };

    if !output.stderr.is_empty() {
        debug!(
            "Task stderr: {:.500}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let result_text = if exec_config.provider == "codex" {
        parse_codex_result(&output.stdout)
    } else {
        parse_claude_result(&output.stdout)
    };
    let status = if output.status.success() {
        "success".to_string()
    } else {
        format!("error:exit_{}", output.status.code().unwrap_or(-1))
    };

    Ok(TaskRunOutcome { result_text, status })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_config(provider: &str, model: &str) -> TaskExecutionConfig {
        TaskExecutionConfig {
            provider: provider.into(),
            model: model.into(),
            reasoning_effort: if provider == "codex" { "high".into() } else { String::new() },
            cli_parameters: vec!["--extra".into()],
            permission_mode: "bypassPermissions".into(),
            working_dir: PathBuf::from("/w"),
        }
    }

    #[test]
    fn claude_args_carry_one_shot_flags() {
        let args = build_claude_args(&exec_config("claude", "opus"), "go");
        assert!(args.contains(&"--no-session-persistence".to_string()));
        assert!(args.contains(&"--extra".to_string()));
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep + 1], "go");
    }

    #[test]
    fn codex_args_carry_sandbox_and_effort() {
        let args = build_codex_args(&exec_config("codex", "gpt-5.2-codex"), "go");
        assert!(args.contains(&"--dangerously-bypass-approvals-and-sandbox".to_string()));
        assert!(args.contains(&"model_reasoning_effort=high".to_string()));
    }

    #[test]
    fn instruction_enrichment_names_memory_file() {
        let enriched = enrich_instruction("Summarize inbox", "mail");
        assert!(enriched.contains("mail_MEMORY.md"));
        assert!(enriched.starts_with("Summarize inbox"));
    }

    #[test]
    fn claude_result_parsing_handles_garbage() {
        assert_eq!(
            parse_claude_result(br#"{"result":"ok"}"#),
            "ok"
        );
        assert_eq!(parse_claude_result(b"plain text"), "plain text");
        assert_eq!(parse_claude_result(b""), "");
    }
}
