//! Async wrapper around the claude CLI.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::events::{parse_stream_line, ResultEvent, StreamEvent};
use super::spawn::{self, find_in_path, STDERR_CAP};
use super::types::CliResponse;
use super::{CliConfig, ProviderCli};
use crate::core::textutil::truncate_lossy;
use crate::errors::{CoreError, CoreResult};
use crate::platform::{NativePlatform, Platform};

pub struct ClaudeCli {
    config: CliConfig,
    binary: PathBuf,
}

impl ClaudeCli {
    pub fn new(config: CliConfig) -> CoreResult<Self> {
        let binary = find_in_path("claude").ok_or_else(|| {
            CoreError::Cli(
                "claude CLI not found on PATH. Install via: npm install -g @anthropic-ai/claude-code"
                    .into(),
            )
        })?;
        info!(
            "CLI wrapper: cwd={}, model={}",
            config.working_dir.display(),
            config.model
        );
        Ok(Self { config, binary })
    }

    fn build_args(
        &self,
        prompt: &str,
        resume_session: Option<&str>,
        continue_session: bool,
        streaming: bool,
        prompt_in_argv: bool,
    ) -> Vec<String> {
        let cfg = &self.config;
        let mut args: Vec<String> = vec!["-p".into()];
        if streaming {
            args.push("--verbose".into());
            args.extend(["--output-format".into(), "stream-json".into()]);
        } else {
            args.extend(["--output-format".into(), "json".into()]);
        }

        add_opt(&mut args, "--permission-mode", Some(cfg.permission_mode.as_str()));
        add_opt(&mut args, "--model", Some(cfg.model.as_str()));
        add_opt(&mut args, "--system-prompt", cfg.system_prompt.as_deref());
        add_opt(
            &mut args,
            "--append-system-prompt",
            cfg.append_system_prompt.as_deref(),
        );
        if let Some(turns) = cfg.max_turns {
            args.extend(["--max-turns".into(), turns.to_string()]);
        }
        if let Some(budget) = cfg.max_budget_usd {
            args.extend(["--max-budget-usd".into(), budget.to_string()]);
        }

        if let Some(session_id) = resume_session {
            args.extend(["--resume".into(), session_id.to_string()]);
        } else if continue_session {
            args.push("--continue".into());
        }

        args.extend(cfg.cli_parameters.iter().cloned());
        args.push("--".into());
        if prompt_in_argv {
            args.push(prompt.to_string());
        }
        args
    }
}

#[async_trait]
impl ProviderCli for ClaudeCli {
    async fn send(
        &self,
        prompt: &str,
        resume_session: Option<&str>,
        continue_session: bool,
        timeout: Option<Duration>,
    ) -> CoreResult<CliResponse> {
        let prompt_in_argv = !NativePlatform::prompt_via_stdin();
        let args = self.build_args(prompt, resume_session, continue_session, false, prompt_in_argv);
        log_cmd(&args, false);

        let stdin_payload = (!prompt_in_argv).then_some(prompt);
        let spawned =
            spawn::spawn_piped(&self.binary, &args, &self.config.working_dir, stdin_payload)
                .await?;
        let output = spawn::communicate(
            spawned,
            timeout,
            &self.config.registry,
            self.config.chat_id,
            &self.config.process_label,
        )
        .await;

        if output.timed_out {
            warn!("CLI timed out");
            return Ok(CliResponse {
                is_error: true,
                timed_out: true,
                ..Default::default()
            });
        }
        Ok(parse_response(&output.stdout, &output.stderr, output.returncode))
    }

    async fn send_streaming(
        &self,
        prompt: &str,
        resume_session: Option<&str>,
        timeout: Option<Duration>,
    ) -> CoreResult<mpsc::Receiver<StreamEvent>> {
        let prompt_in_argv = !NativePlatform::prompt_via_stdin();
        let args = self.build_args(prompt, resume_session, false, true, prompt_in_argv);
        log_cmd(&args, true);

        let stdin_payload = (!prompt_in_argv).then_some(prompt);
        let spawned =
            spawn::spawn_piped(&self.binary, &args, &self.config.working_dir, stdin_payload)
                .await?;

        let (tx, rx) = spawn::stream_channel();
        let registry = self.config.registry.clone();
        let chat_id = self.config.chat_id;
        let label = self.config.process_label.clone();

        tokio::spawn(async move {
            let outcome = spawn::pump_stream(
                spawned,
                timeout,
                &registry,
                chat_id,
                &label,
                parse_stream_line,
                &tx,
            )
            .await;

            if outcome.timed_out {
                warn!("CLI stream timed out");
                let _ = tx
                    .send(StreamEvent::Result(ResultEvent {
                        is_error: true,
                        ..Default::default()
                    }))
                    .await;
                return;
            }

            if !outcome.saw_result && outcome.exit_code.unwrap_or(0) != 0 {
                let stderr_preview = if outcome.stderr.is_empty() {
                    "(no stderr)"
                } else {
                    outcome.stderr.as_str()
                };
                warn!(
                    "CLI stream exited with code {:?}: {:.200}",
                    outcome.exit_code, stderr_preview
                );
                let mut detail = outcome.stderr.clone();
                truncate_lossy(&mut detail, 500);
                let _ = tx
                    .send(StreamEvent::Result(ResultEvent {
                        result: detail,
                        is_error: true,
                        returncode: outcome.exit_code,
                        ..Default::default()
                    }))
                    .await;
            }
        });

        Ok(rx)
    }
}

fn add_opt(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(value) = value {
        if !value.is_empty() {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
    }
}

fn log_cmd(args: &[String], streaming: bool) {
    let safe: Vec<String> = args
        .iter()
        .map(|a| {
            if a.len() > 80 {
                let cut = (0..=80).rev().find(|i| a.is_char_boundary(*i)).unwrap_or(0);
                format!("{}...", &a[..cut])
            } else {
                a.clone()
            }
        })
        .collect();
    let prefix = if streaming { "CLI stream cmd" } else { "CLI cmd" };
    info!("{}: claude {}", prefix, safe.join(" "));
}

fn parse_response(stdout: &[u8], stderr: &[u8], returncode: Option<i32>) -> CliResponse {
    let mut stderr_text = String::from_utf8_lossy(stderr).to_string();
    truncate_lossy(&mut stderr_text, STDERR_CAP);
    if !stderr_text.is_empty() {
        warn!("CLI stderr: {:.500}", stderr_text);
    }

    let raw = String::from_utf8_lossy(stdout).trim().to_string();
    if raw.is_empty() {
        error!("CLI returned empty output (exit={:?})", returncode);
        return CliResponse {
            is_error: true,
            returncode,
            stderr: stderr_text,
            ..Default::default()
        };
    }

    let data: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to parse CLI JSON ({err}): {:.500}", raw);
            return CliResponse {
                result: raw,
                is_error: true,
                returncode,
                stderr: stderr_text,
                ..Default::default()
            };
        }
    };

    let usage = data
        .get("usage")
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let response = CliResponse {
        session_id: data
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        result: data
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        is_error: data.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        returncode,
        stderr: stderr_text,
        timed_out: false,
        duration_ms: data.get("duration_ms").and_then(Value::as_f64),
        duration_api_ms: data.get("duration_api_ms").and_then(Value::as_f64),
        num_turns: data
            .get("num_turns")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        total_cost_usd: data.get("total_cost_usd").and_then(Value::as_f64),
        usage,
    };

    if response.is_error {
        error!("CLI error: {:.200}", response.result);
    } else {
        info!(
            "CLI done session={} turns={:?} cost=${:.4} tokens={}",
            response
                .session_id
                .as_deref()
                .map(|s| &s[..s.len().min(8)])
                .unwrap_or("?"),
            response.num_turns,
            response.total_cost_usd.unwrap_or(0.0),
            response.total_tokens(),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_reads_result_json() {
        let stdout = br#"{"session_id":"s9","result":"hi","is_error":false,"total_cost_usd":0.01,"usage":{"input_tokens":5,"output_tokens":2}}"#;
        let resp = parse_response(stdout, b"", Some(0));
        assert_eq!(resp.session_id.as_deref(), Some("s9"));
        assert_eq!(resp.result, "hi");
        assert!(!resp.is_error);
        assert_eq!(resp.total_tokens(), 7);
    }

    #[test]
    fn parse_response_flags_garbage_as_error() {
        let resp = parse_response(b"not json at all", b"boom", Some(1));
        assert!(resp.is_error);
        assert_eq!(resp.result, "not json at all");
        assert_eq!(resp.stderr, "boom");
    }

    #[test]
    fn parse_response_flags_empty_output() {
        let resp = parse_response(b"", b"", Some(2));
        assert!(resp.is_error);
        assert_eq!(resp.returncode, Some(2));
    }
}
