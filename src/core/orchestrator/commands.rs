//! Slash-command table and handlers.
//!
//! Dispatch is a linear scan with exact-match priority, then
//! trailing-space prefix matches (`/model <name>`). Responses share one
//! title/separator/body layout.

use tracing::info;

use super::{Orchestrator, OrchestratorResult};
use crate::config::ModelRegistry;
use crate::core::cli::auth::{check_all_auth, AuthStatus};
use crate::core::workspace::loader::read_mainmemory;
use crate::errors::CoreResult;

pub const SEP: &str = "------------------------------";

pub const NEW_SESSION_TEXT: &str = "New session started. The old conversation is closed.";

/// Assemble a reply from title/separator/body segments.
pub fn fmt(parts: &[&str]) -> String {
    parts.join("\n")
}

pub fn stop_text(killed: bool, provider: &str) -> String {
    if killed {
        format!("Stopped the running {provider} call.")
    } else {
        "Nothing is running right now.".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    New,
    Stop,
    Status,
    Model,
    Memory,
    Cron,
    Diagnose,
    ShowFiles,
}

struct CommandSpec {
    name: &'static str,
    /// When set, `name` must end with a space and matches as a prefix.
    prefix: bool,
    command: Command,
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "/new", prefix: false, command: Command::New },
    CommandSpec { name: "/stop", prefix: false, command: Command::Stop },
    CommandSpec { name: "/status", prefix: false, command: Command::Status },
    CommandSpec { name: "/model", prefix: false, command: Command::Model },
    CommandSpec { name: "/model ", prefix: true, command: Command::Model },
    CommandSpec { name: "/memory", prefix: false, command: Command::Memory },
    CommandSpec { name: "/cron", prefix: false, command: Command::Cron },
    CommandSpec { name: "/diagnose", prefix: false, command: Command::Diagnose },
    CommandSpec { name: "/showfiles", prefix: false, command: Command::ShowFiles },
];

/// Match a normalized (trimmed, lowercased) command string.
pub fn match_command(cmd: &str) -> Option<Command> {
    for spec in COMMANDS {
        if spec.prefix {
            if cmd.starts_with(spec.name) {
                return Some(spec.command);
            }
        } else if cmd == spec.name {
            return Some(spec.command);
        }
    }
    None
}

pub async fn dispatch(
    orch: &Orchestrator,
    command: Command,
    chat_id: i64,
    text: &str,
) -> CoreResult<OrchestratorResult> {
    match command {
        Command::New => cmd_reset(orch, chat_id).await,
        Command::Stop => cmd_stop(orch, chat_id).await,
        Command::Status => cmd_status(orch, chat_id).await,
        Command::Model => cmd_model(orch, chat_id, text).await,
        Command::Memory => cmd_memory(orch).await,
        Command::Cron => cmd_cron(orch).await,
        Command::Diagnose => cmd_diagnose(orch).await,
        Command::ShowFiles => cmd_showfiles(orch).await,
    }
}

async fn cmd_reset(orch: &Orchestrator, chat_id: i64) -> CoreResult<OrchestratorResult> {
    info!("Reset requested");
    orch.registry().kill_all(chat_id).await;
    orch.reset_session(chat_id).await?;
    Ok(OrchestratorResult::text(NEW_SESSION_TEXT))
}

async fn cmd_stop(orch: &Orchestrator, chat_id: i64) -> CoreResult<OrchestratorResult> {
    info!("Stop requested");
    let killed = orch.registry().kill_all(chat_id).await;
    Ok(OrchestratorResult::text(&stop_text(
        killed > 0,
        &orch.active_provider(),
    )))
}

async fn cmd_status(orch: &Orchestrator, chat_id: i64) -> CoreResult<OrchestratorResult> {
    info!("Status requested");
    let mut lines: Vec<String> = vec!["**Status**".into(), SEP.into()];
    lines.push(format!("Provider: {}", orch.active_provider()));
    lines.push(format!("Model: {}", orch.cli_service().default_model()));

    let available = orch.cli_service().available_providers();
    lines.push(format!(
        "Authenticated: {}",
        if available.is_empty() {
            "none".to_string()
        } else {
            available.join(", ")
        }
    ));

    match orch.sessions().get_active(chat_id).await {
        Some(session) => {
            let sid = session.session_id();
            lines.push(format!(
                "Session: {} ({} messages, ${:.4}, {} tokens)",
                if sid.is_empty() { "<new>" } else { &sid[..sid.len().min(8)] },
                session.message_count(),
                session.total_cost_usd(),
                session.total_tokens(),
            ));
        }
        None => lines.push("Session: none".into()),
    }

    if orch.registry().has_active(chat_id) {
        lines.push("Agent: busy".into());
    } else {
        lines.push("Agent: idle".into());
    }
    Ok(OrchestratorResult::text(&lines.join("\n")))
}

async fn cmd_model(
    orch: &Orchestrator,
    chat_id: i64,
    text: &str,
) -> CoreResult<OrchestratorResult> {
    info!("Model requested");
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let _cmd = parts.next();
    let name = parts.next().map(str::trim).unwrap_or("");

    if name.is_empty() {
        let current = orch.cli_service().default_model();
        let body = ModelRegistry::known_claude_models()
            .iter()
            .map(|m| {
                if *m == current {
                    format!("- {m} (active)")
                } else {
                    format!("- {m}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(OrchestratorResult::text(&fmt(&[
            "**Model**",
            SEP,
            &body,
            SEP,
            "Switch with /model <name>, or prefix one message with @<name>.",
        ])));
    }

    orch.switch_model(chat_id, name).await
}

async fn cmd_memory(orch: &Orchestrator) -> CoreResult<OrchestratorResult> {
    info!("Memory requested");
    let paths = orch.paths().clone();
    let content = tokio::task::spawn_blocking(move || read_mainmemory(&paths))
        .await
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Ok(OrchestratorResult::text(&fmt(&[
            "**Main Memory**",
            SEP,
            "Empty. The agent will build memory as you interact.",
            SEP,
            "Tip: ask your agent to \"remember\" something to get started.",
        ])));
    }
    Ok(OrchestratorResult::text(&fmt(&[
        "**Main Memory**",
        SEP,
        &content,
        SEP,
        "Tip: the agent reads and updates this automatically.",
    ])))
}

async fn cmd_cron(orch: &Orchestrator) -> CoreResult<OrchestratorResult> {
    info!("Cron requested");
    let jobs = orch.cron_store().list_jobs();
    if jobs.is_empty() {
        return Ok(OrchestratorResult::text(&fmt(&[
            "**Cron Jobs**",
            SEP,
            "No jobs configured. Ask the agent to schedule one.",
        ])));
    }
    let mut lines: Vec<String> = vec!["**Cron Jobs**".into(), SEP.into()];
    for job in jobs {
        let marker = if job.enabled { "on" } else { "off" };
        let status = job.last_run_status.as_deref().unwrap_or("never run");
        lines.push(format!(
            "[{marker}] {} -- {} ({}, last: {status})",
            job.id, job.title, job.schedule
        ));
    }
    Ok(OrchestratorResult::text(&lines.join("\n")))
}

async fn cmd_diagnose(orch: &Orchestrator) -> CoreResult<OrchestratorResult> {
    info!("Diagnose requested");
    let mut lines: Vec<String> = vec!["**Diagnose**".into(), SEP.into()];

    let auth = tokio::task::spawn_blocking(check_all_auth)
        .await
        .unwrap_or_default();
    for result in auth {
        let detail = match result.status {
            AuthStatus::Authenticated => "authenticated".to_string(),
            AuthStatus::Installed => "installed, NOT authenticated".to_string(),
            AuthStatus::NotFound => "not found".to_string(),
        };
        lines.push(format!("Provider [{}]: {detail}", result.provider));
    }

    let paths = orch.paths();
    for (label, path) in [
        ("workspace", paths.workspace()),
        ("cron_tasks", paths.cron_tasks_dir()),
        ("sessions", paths.sessions_path()),
        ("cron_jobs", paths.cron_jobs_path()),
        ("webhooks", paths.webhooks_path()),
    ] {
        let state = if path.exists() { "ok" } else { "missing" };
        lines.push(format!("{label}: {state}"));
    }

    lines.push(format!(
        "Webhook server: {} ({} hooks)",
        if orch.config().webhooks.enabled { "enabled" } else { "disabled" },
        orch.webhook_store().list_hooks().len()
    ));
    lines.push(format!("Cron jobs: {}", orch.cron_store().list_jobs().len()));
    Ok(OrchestratorResult::text(&lines.join("\n")))
}

async fn cmd_showfiles(orch: &Orchestrator) -> CoreResult<OrchestratorResult> {
    info!("File listing requested");
    let output_dir = orch.paths().output_to_user_dir();
    let listing = tokio::task::spawn_blocking(move || {
        let mut names: Vec<String> = std::fs::read_dir(&output_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_file())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    })
    .await
    .unwrap_or_default();

    if listing.is_empty() {
        return Ok(OrchestratorResult::text(&fmt(&[
            "**Files**",
            SEP,
            "output_to_user/ is empty.",
        ])));
    }
    let body = listing
        .iter()
        .map(|name| format!("- {name}"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(OrchestratorResult::text(&fmt(&["**Files**", SEP, &body])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_beats_prefix() {
        assert_eq!(match_command("/model"), Some(Command::Model));
        assert_eq!(match_command("/model sonnet"), Some(Command::Model));
        assert_eq!(match_command("/new"), Some(Command::New));
        assert_eq!(match_command("/modelx"), None);
        assert_eq!(match_command("/unknown"), None);
    }

    #[test]
    fn stop_text_variants() {
        assert!(stop_text(true, "claude").contains("claude"));
        assert!(stop_text(false, "claude").contains("Nothing"));
    }
}
