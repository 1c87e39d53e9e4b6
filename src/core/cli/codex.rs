//! Async wrapper around the codex CLI.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::codex_events::{parse_codex_jsonl, parse_codex_stream_line};
use super::events::{ResultEvent, StreamEvent};
use super::spawn::{self, find_in_path, STDERR_CAP};
use super::types::CliResponse;
use super::{CliConfig, ProviderCli};
use crate::core::textutil::truncate_lossy;
use crate::errors::{CoreError, CoreResult};
use crate::platform::{NativePlatform, Platform};

pub struct CodexCli {
    config: CliConfig,
    binary: PathBuf,
}

impl CodexCli {
    pub fn new(config: CliConfig) -> CoreResult<Self> {
        let binary = find_in_path("codex").ok_or_else(|| {
            CoreError::Cli("codex CLI not found on PATH. Install via: npm install -g @openai/codex".into())
        })?;
        info!(
            "Codex CLI wrapper: cwd={}, model={}",
            config.working_dir.display(),
            config.model
        );
        Ok(Self { config, binary })
    }

    /// Fold system context into the user prompt; codex has no
    /// system-prompt flag.
    fn compose_prompt(&self, prompt: &str) -> String {
        let cfg = &self.config;
        let mut parts: Vec<&str> = Vec::new();
        if let Some(system) = cfg.system_prompt.as_deref() {
            parts.push(system);
        }
        parts.push(prompt);
        if let Some(appended) = cfg.append_system_prompt.as_deref() {
            parts.push(appended);
        }
        parts.join("\n\n")
    }

    fn sandbox_flags(&self) -> Vec<String> {
        if self.config.permission_mode == "bypassPermissions" {
            vec!["--dangerously-bypass-approvals-and-sandbox".into()]
        } else {
            vec!["--full-auto".into()]
        }
    }

    fn build_args(
        &self,
        final_prompt: &str,
        resume_session: Option<&str>,
        prompt_in_argv: bool,
    ) -> Vec<String> {
        let cfg = &self.config;

        if let Some(session_id) = resume_session {
            let mut args: Vec<String> = vec!["exec".into(), "resume".into(), "--json".into()];
            args.extend(self.sandbox_flags());
            args.push("--".into());
            args.push(session_id.to_string());
            if prompt_in_argv {
                args.push(final_prompt.to_string());
            }
            return args;
        }

        let mut args: Vec<String> = vec![
            "exec".into(),
            "--json".into(),
            "--color".into(),
            "never".into(),
        ];
        args.extend(self.sandbox_flags());
        args.push("--skip-git-repo-check".into());
        if !cfg.model.is_empty() {
            args.extend(["--model".into(), cfg.model.clone()]);
        }
        if !cfg.reasoning_effort.is_empty() && cfg.reasoning_effort != "default" {
            args.extend([
                "-c".into(),
                format!("model_reasoning_effort={}", cfg.reasoning_effort),
            ]);
        }
        args.extend(cfg.cli_parameters.iter().cloned());
        args.push("--".into());
        if prompt_in_argv {
            args.push(final_prompt.to_string());
        }
        args
    }
}

#[async_trait]
impl ProviderCli for CodexCli {
    async fn send(
        &self,
        prompt: &str,
        resume_session: Option<&str>,
        continue_session: bool,
        timeout: Option<Duration>,
    ) -> CoreResult<CliResponse> {
        if continue_session {
            info!("continue_session is not supported by the codex CLI, ignoring");
        }
        let final_prompt = self.compose_prompt(prompt);
        let prompt_in_argv = !NativePlatform::prompt_via_stdin();
        let args = self.build_args(&final_prompt, resume_session, prompt_in_argv);
        log_cmd(&args, false);

        let stdin_payload = (!prompt_in_argv).then_some(final_prompt.as_str());
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
            warn!("Codex CLI timed out");
            return Ok(CliResponse {
                is_error: true,
                timed_out: true,
                ..Default::default()
            });
        }
        Ok(parse_output(&output.stdout, &output.stderr, output.returncode))
    }

    async fn send_streaming(
        &self,
        prompt: &str,
        resume_session: Option<&str>,
        timeout: Option<Duration>,
    ) -> CoreResult<mpsc::Receiver<StreamEvent>> {
        let final_prompt = self.compose_prompt(prompt);
        let prompt_in_argv = !NativePlatform::prompt_via_stdin();
        let args = self.build_args(&final_prompt, resume_session, prompt_in_argv);
        log_cmd(&args, true);

        let stdin_payload = (!prompt_in_argv).then_some(final_prompt.as_str());
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
                parse_codex_stream_line,
                &tx,
            )
            .await;

            if outcome.timed_out {
                warn!("Codex stream timed out");
                let _ = tx
                    .send(StreamEvent::Result(ResultEvent {
                        is_error: true,
                        ..Default::default()
                    }))
                    .await;
                return;
            }

            // Codex never emits an explicit result event; synthesize one
            // from what the stream carried.
            let final_event = if outcome.exit_code.unwrap_or(0) != 0 {
                let detail = if !outcome.stderr.is_empty() {
                    outcome.stderr.clone()
                } else if !outcome.accumulated.is_empty() {
                    outcome.accumulated.clone()
                } else {
                    "(no output)".to_string()
                };
                error!(
                    "Codex stream exited with code {:?}: {:.300}",
                    outcome.exit_code, detail
                );
                let mut truncated = detail;
                truncate_lossy(&mut truncated, 500);
                ResultEvent {
                    result: truncated,
                    is_error: true,
                    returncode: outcome.exit_code,
                    ..Default::default()
                }
            } else {
                ResultEvent {
                    session_id: outcome.session_id.clone(),
                    result: outcome.accumulated.clone(),
                    is_error: false,
                    returncode: outcome.exit_code,
                    ..Default::default()
                }
            };
            let _ = tx.send(StreamEvent::Result(final_event)).await;
        });

        Ok(rx)
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
    let prefix = if streaming { "Codex stream cmd" } else { "Codex cmd" };
    info!("{}: codex {}", prefix, safe.join(" "));
}

fn parse_output(stdout: &[u8], stderr: &[u8], returncode: Option<i32>) -> CliResponse {
    let mut stderr_text = String::from_utf8_lossy(stderr).to_string();
    truncate_lossy(&mut stderr_text, STDERR_CAP);
    if !stderr_text.is_empty() {
        warn!("Codex stderr (exit={:?}): {:.500}", returncode, stderr_text);
    }

    let raw = String::from_utf8_lossy(stdout).trim().to_string();
    if raw.is_empty() {
        error!("Codex returned empty output (exit={:?})", returncode);
        return CliResponse {
            is_error: true,
            returncode,
            stderr: stderr_text,
            ..Default::default()
        };
    }

    let exit_error = returncode.unwrap_or(1) != 0;
    let (result_text, thread_id, usage) = parse_codex_jsonl(&raw);
    let is_error = exit_error || result_text.is_empty();
    let response = CliResponse {
        session_id: thread_id,
        result: if result_text.is_empty() {
            let mut fallback = raw.clone();
            truncate_lossy(&mut fallback, 2000);
            fallback
        } else {
            result_text
        },
        is_error,
        returncode,
        stderr: stderr_text,
        usage,
        ..Default::default()
    };

    if response.is_error {
        error!(
            "Codex error exit={:?}: {:.300}",
            returncode, response.result
        );
    } else {
        info!(
            "Codex done session={} tokens={}",
            response
                .session_id
                .as_deref()
                .map(|s| &s[..s.len().min(8)])
                .unwrap_or("?"),
            response.total_tokens(),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_output_reads_jsonl() {
        let stdout = br#"{"type":"thread.started","thread_id":"t-1"}
{"type":"item.completed","item":{"type":"agent_message","text":"done"}}
{"type":"turn.completed","usage":{"input_tokens":3,"output_tokens":4}}"#;
        let resp = parse_output(stdout, b"", Some(0));
        assert_eq!(resp.session_id.as_deref(), Some("t-1"));
        assert_eq!(resp.result, "done");
        assert!(!resp.is_error);
        assert_eq!(resp.total_tokens(), 7);
    }

    #[test]
    fn parse_output_nonzero_exit_is_error() {
        let stdout = br#"{"type":"item.completed","item":{"type":"agent_message","text":"partial"}}"#;
        let resp = parse_output(stdout, b"crash", Some(3));
        assert!(resp.is_error);
        assert_eq!(resp.result, "partial");
    }
}
