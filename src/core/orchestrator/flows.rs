//! Conversation flows: normal message handling with session resume, and
//! the heartbeat turn.

use chrono::Utc;
use tracing::{info, warn};

use super::hooks::HookContext;
use super::{Orchestrator, OrchestratorResult};
use crate::core::cli::service::StreamSink;
use crate::core::cli::types::{AgentRequest, AgentResponse};
use crate::core::session::SessionData;
use crate::core::textutil::truncate_lossy;
use crate::core::workspace::loader::read_mainmemory;
use crate::errors::CoreResult;

/// Shared setup for the normal flow: resolve target and session, apply
/// hooks, build the request.
async fn prepare_normal(
    orch: &Orchestrator,
    chat_id: i64,
    text: &str,
    model_override: Option<&str>,
) -> CoreResult<(AgentRequest, SessionData, bool)> {
    let requested_model = model_override
        .map(str::to_string)
        .unwrap_or_else(|| orch.cli_service().default_model());
    let (req_model, req_provider) = orch.resolve_runtime_target(&requested_model)?;

    let (session, is_new) = orch
        .sessions()
        .resolve_session(chat_id, &req_provider, &req_model)
        .await?;
    info!(
        "Session resolved sid={} new={} msgs={}",
        if session.session_id().is_empty() {
            "<new>"
        } else {
            &session.session_id()[..session.session_id().len().min(8)]
        },
        is_new,
        session.message_count(),
    );

    // First call on a fresh bucket carries the long-term memory file.
    let append_prompt = if is_new {
        let paths = orch.paths().clone();
        let mainmemory = tokio::task::spawn_blocking(move || read_mainmemory(&paths))
            .await
            .unwrap_or_default();
        (!mainmemory.trim().is_empty()).then_some(mainmemory)
    } else {
        None
    };

    let hook_ctx = HookContext {
        chat_id,
        message_count: session.message_count(),
        is_new_session: is_new,
        provider: req_provider.clone(),
        model: req_model.clone(),
    };
    let prompt = orch.hooks().apply(text, &hook_ctx);

    let resume = (!is_new && !session.session_id().is_empty())
        .then(|| session.session_id().to_string());
    let request = AgentRequest {
        prompt,
        append_system_prompt: append_prompt,
        model_override: Some(req_model),
        provider_override: Some(req_provider),
        chat_id,
        process_label: "main".into(),
        resume_session: resume,
        timeout: Some(orch.config().cli_timeout_secs()),
        ..Default::default()
    };
    Ok((request, session, is_new))
}

/// Store the CLI-issued session id and bump metrics.
async fn update_session(
    orch: &Orchestrator,
    session: &mut SessionData,
    response: &AgentResponse,
) -> CoreResult<()> {
    if let Some(new_id) = response.session_id.as_deref() {
        if !new_id.is_empty() && new_id != session.session_id() {
            info!(
                "Session ID updated: {} -> {}",
                if session.session_id().is_empty() {
                    "<new>"
                } else {
                    &session.session_id()[..session.session_id().len().min(8)]
                },
                &new_id[..new_id.len().min(8)],
            );
            session.set_session_id(new_id);
        }
    }
    orch.sessions()
        .update_session(session, response.cost_usd, response.total_tokens)
        .await
}

/// Kill processes, reset the provider bucket, return the user-facing
/// session-reset message.
async fn reset_on_error(
    orch: &Orchestrator,
    chat_id: i64,
    model: &str,
    provider: &str,
) -> CoreResult<OrchestratorResult> {
    orch.registry().kill_all(chat_id).await;
    orch.sessions()
        .reset_provider_session(chat_id, provider, model)
        .await?;
    warn!("Session error reset model={model}");
    Ok(OrchestratorResult::text(&format!(
        "[{model}] Session error. New session started."
    )))
}

fn request_target(orch: &Orchestrator, request: &AgentRequest) -> (String, String) {
    let model = request
        .model_override
        .clone()
        .unwrap_or_else(|| orch.cli_service().default_model());
    let provider = request
        .provider_override
        .clone()
        .unwrap_or_else(|| crate::config::ModelRegistry::provider_for(&model).to_string());
    (model, provider)
}

/// Footer nudging `/new` once the session is old; shown every 10th
/// message to avoid spam.
fn session_age_note(session: &SessionData, warning_hours: u64) -> String {
    if warning_hours == 0 {
        return String::new();
    }
    let age_hours = (Utc::now() - session.created_at).num_hours();
    if age_hours < warning_hours as i64 {
        return String::new();
    }
    if session.message_count() % 10 != 0 {
        return String::new();
    }
    let age_label = if age_hours < 48 {
        format!("{age_hours}h")
    } else {
        format!("{}d", age_hours / 24)
    };
    format!("\n\n---\n[Session is {age_label} old. Use /new for a fresh start.]")
}

fn finish_normal(
    response: AgentResponse,
    session: Option<&SessionData>,
    warning_hours: u64,
) -> OrchestratorResult {
    if response.is_error {
        if response.timed_out {
            return OrchestratorResult::text("Agent timed out. Please try again.");
        }
        if !response.result.trim().is_empty() {
            let mut detail = response.result;
            truncate_lossy(&mut detail, 500);
            return OrchestratorResult::text(&format!("Error: {detail}"));
        }
        return OrchestratorResult::text("Error: check logs for details.");
    }

    let mut text = response.result;
    if let Some(session) = session {
        text.push_str(&session_age_note(session, warning_hours));
    }
    OrchestratorResult {
        text,
        stream_fallback: response.stream_fallback,
    }
}

/// Normal conversation flow. The only automatic retry in the system lives
/// here: a failed call that supplied a resume id resets the provider
/// bucket and retries exactly once as a fresh session.
pub async fn normal(
    orch: &Orchestrator,
    chat_id: i64,
    text: &str,
    model_override: Option<&str>,
    sink: Option<&dyn StreamSink>,
) -> CoreResult<OrchestratorResult> {
    info!("Normal flow starting");
    let (mut request, mut session, _is_new) =
        prepare_normal(orch, chat_id, text, model_override).await?;

    let mut response = execute(orch, &request, sink).await?;
    if orch.registry().was_aborted(chat_id) {
        info!("Normal flow aborted by user");
        return Ok(OrchestratorResult::text(""));
    }

    if response.is_error && request.resume_session.is_some() {
        let resume = request.resume_session.clone().unwrap_or_default();
        warn!(
            "Resume failed sid={}, retrying fresh",
            &resume[..resume.len().min(8)]
        );
        let (model, provider) = request_target(orch, &request);
        orch.sessions()
            .reset_provider_session(chat_id, &provider, &model)
            .await?;
        let (fresh_request, fresh_session, _) =
            prepare_normal(orch, chat_id, text, model_override).await?;
        request = fresh_request;
        session = fresh_session;
        response = execute(orch, &request, sink).await?;
    }

    if response.is_error {
        if orch.registry().was_aborted(chat_id) {
            info!("Normal flow aborted by user (after retry)");
            return Ok(OrchestratorResult::text(""));
        }
        let (model, provider) = request_target(orch, &request);
        return reset_on_error(orch, chat_id, &model, &provider).await;
    }

    update_session(orch, &mut session, &response).await?;
    info!("Normal flow completed");
    Ok(finish_normal(
        response,
        Some(&session),
        orch.config().session_age_warning_hours,
    ))
}

async fn execute(
    orch: &Orchestrator,
    request: &AgentRequest,
    sink: Option<&dyn StreamSink>,
) -> CoreResult<AgentResponse> {
    match sink {
        Some(sink) => orch.cli_service().execute_streaming(request, sink).await,
        None => orch.cli_service().execute(request).await,
    }
}

/// Strip a leading/trailing ack token from the heartbeat response.
fn strip_ack_token(text: &str, token: &str) -> String {
    let stripped = text.trim();
    if stripped == token {
        return String::new();
    }
    let mut out = stripped.to_string();
    if let Some(rest) = out.strip_prefix(token) {
        out = rest.trim().to_string();
    }
    if let Some(rest) = out.strip_suffix(token) {
        out = rest.trim().to_string();
    }
    out
}

/// One heartbeat turn in the existing session. Returns alert text, or
/// None when the agent acknowledged quietly. Ack responses do not touch
/// session metrics.
pub async fn heartbeat_flow(orch: &Orchestrator, chat_id: i64) -> CoreResult<Option<String>> {
    let hb = &orch.config().heartbeat;
    let (req_model, req_provider) =
        orch.resolve_runtime_target(&orch.cli_service().default_model())?;

    // Read-only: the heartbeat never creates or overwrites a session.
    let Some(mut session) = orch.sessions().get_active(chat_id).await else {
        info!("Heartbeat skipped: no active session");
        return Ok(None);
    };
    if session.session_id().is_empty() {
        info!("Heartbeat skipped: no session id");
        return Ok(None);
    }
    if session.provider != req_provider {
        info!(
            "Heartbeat skipped: provider mismatch session={} current={}",
            session.provider, req_provider
        );
        return Ok(None);
    }

    let idle = Utc::now() - session.last_active;
    let cooldown = chrono::Duration::minutes(hb.cooldown_minutes as i64);
    if idle < cooldown {
        info!(
            "Heartbeat skipped: idle={}s cooldown={}s",
            idle.num_seconds(),
            cooldown.num_seconds()
        );
        return Ok(None);
    }

    let request = AgentRequest {
        prompt: hb.prompt.clone(),
        model_override: Some(req_model),
        provider_override: Some(req_provider),
        chat_id,
        process_label: "heartbeat".into(),
        resume_session: Some(session.session_id().to_string()),
        timeout: Some(orch.config().cli_timeout_secs()),
        ..Default::default()
    };

    let response = orch.cli_service().execute(&request).await?;
    if response.is_error {
        warn!("Heartbeat CLI error result={:.200}", response.result);
        return Ok(None);
    }

    let alert = strip_ack_token(&response.result, &hb.ack_token);
    if alert.is_empty() {
        info!("Heartbeat OK (suppressed)");
        return Ok(None);
    }

    update_session(orch, &mut session, &response).await?;
    info!("Heartbeat alert chars={}", alert.len());
    Ok(Some(alert))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_token_stripping() {
        assert_eq!(strip_ack_token("HEARTBEAT_OK", "HEARTBEAT_OK"), "");
        assert_eq!(strip_ack_token("  HEARTBEAT_OK  ", "HEARTBEAT_OK"), "");
        assert_eq!(
            strip_ack_token("HEARTBEAT_OK but also this", "HEARTBEAT_OK"),
            "but also this"
        );
        assert_eq!(strip_ack_token("all clear", "HEARTBEAT_OK"), "all clear");
    }

    #[test]
    fn error_responses_map_to_user_messages() {
        let timed_out = AgentResponse {
            is_error: true,
            timed_out: true,
            ..Default::default()
        };
        assert!(finish_normal(timed_out, None, 0).text.contains("timed out"));

        let with_detail = AgentResponse {
            is_error: true,
            result: "quota exceeded".into(),
            ..Default::default()
        };
        assert!(finish_normal(with_detail, None, 0).text.contains("quota exceeded"));

        let bare = AgentResponse {
            is_error: true,
            ..Default::default()
        };
        assert!(finish_normal(bare, None, 0).text.contains("check logs"));
    }

    #[test]
    fn age_note_only_on_tenth_messages() {
        let mut session = SessionData::new(1, "claude", "opus");
        session.created_at = Utc::now() - chrono::Duration::hours(20);
        // message_count 0 -> note shown (0 % 10 == 0).
        assert!(!session_age_note(&session, 12).is_empty());
        session.provider_sessions.entry("claude".into()).or_default().message_count = 7;
        assert!(session_age_note(&session, 12).is_empty());
        // Young session: never.
        session.created_at = Utc::now();
        session.provider_sessions.entry("claude".into()).or_default().message_count = 10;
        assert!(session_age_note(&session, 12).is_empty());
    }
}
