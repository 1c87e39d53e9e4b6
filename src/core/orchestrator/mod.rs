//! Core orchestrator: routes incoming text through command dispatch,
//! directives, and the conversation flows.

pub mod commands;
pub mod directives;
pub mod flows;
pub mod hooks;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{update_config_file, AgentConfig, ModelRegistry};
use crate::core::cli::registry::ProcessRegistry;
use crate::core::cli::service::{CliService, StreamSink};
use crate::core::cron::store::CronStore;
use crate::core::paths::TetherPaths;
use crate::core::security::detect_suspicious_patterns;
use crate::core::session::SessionStore;
use crate::core::webhook::store::WebhookStore;
use crate::errors::CoreResult;

use self::directives::parse_directives;
use self::hooks::{MessageHookRegistry, MAINMEMORY_REMINDER};

/// Structured return from `handle_message`.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorResult {
    pub text: String,
    /// Streaming failed and the text came from the fallback path; internal
    /// telemetry only.
    pub stream_fallback: bool,
}

impl OrchestratorResult {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            stream_fallback: false,
        }
    }
}

pub struct Orchestrator {
    config: Arc<AgentConfig>,
    paths: TetherPaths,
    models: ModelRegistry,
    sessions: Arc<SessionStore>,
    registry: Arc<ProcessRegistry>,
    cli_service: Arc<CliService>,
    cron_store: Arc<CronStore>,
    webhook_store: Arc<WebhookStore>,
    hooks: MessageHookRegistry,
    known_models: Vec<String>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AgentConfig>,
        paths: TetherPaths,
        sessions: Arc<SessionStore>,
        registry: Arc<ProcessRegistry>,
        cli_service: Arc<CliService>,
        cron_store: Arc<CronStore>,
        webhook_store: Arc<WebhookStore>,
    ) -> Self {
        let mut hooks = MessageHookRegistry::new();
        hooks.register(MAINMEMORY_REMINDER);
        let known_models = ModelRegistry::known_claude_models()
            .iter()
            .map(|m| m.to_string())
            .collect();
        Self {
            config,
            paths,
            models: ModelRegistry,
            sessions,
            registry,
            cli_service,
            cron_store,
            webhook_store,
            hooks,
            known_models,
        }
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    pub fn paths(&self) -> &TetherPaths {
        &self.paths
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn cli_service(&self) -> &Arc<CliService> {
        &self.cli_service
    }

    pub fn cron_store(&self) -> &Arc<CronStore> {
        &self.cron_store
    }

    pub fn webhook_store(&self) -> &Arc<WebhookStore> {
        &self.webhook_store
    }

    pub fn hooks(&self) -> &MessageHookRegistry {
        &self.hooks
    }

    /// Provider of the current default model after availability fallback.
    pub fn active_provider(&self) -> String {
        self.resolve_runtime_target(&self.cli_service.default_model())
            .map(|(_, provider)| provider)
            .unwrap_or_else(|_| self.config.provider.clone())
    }

    /// Resolve `(model, provider)` against the authenticated provider set.
    pub fn resolve_runtime_target(&self, model: &str) -> CoreResult<(String, String)> {
        let available = self.cli_service.available_providers();
        if available.is_empty() {
            return Ok((
                model.to_string(),
                ModelRegistry::provider_for(model).to_string(),
            ));
        }
        self.models.resolve_for_provider(model, &available)
    }

    /// Main entry point: route a message to the right handler.
    pub async fn handle_message(&self, chat_id: i64, text: &str) -> OrchestratorResult {
        self.handle_message_impl(chat_id, text, None).await
    }

    /// Streaming variant: deltas, tool indicators, and status updates go
    /// to `sink` while the final text comes back as the result.
    pub async fn handle_message_streaming(
        &self,
        chat_id: i64,
        text: &str,
        sink: &dyn StreamSink,
    ) -> OrchestratorResult {
        self.handle_message_impl(chat_id, text, Some(sink)).await
    }

    /// Inline-control responses that are not handled by the chat layer
    /// route through normal dispatch.
    pub async fn handle_callback(&self, chat_id: i64, data: &str) -> OrchestratorResult {
        self.handle_message_impl(chat_id, data, None).await
    }

    async fn handle_message_impl(
        &self,
        chat_id: i64,
        text: &str,
        sink: Option<&dyn StreamSink>,
    ) -> OrchestratorResult {
        // A fresh message clears the abort latch from any prior kill.
        self.registry.clear_abort(chat_id);
        let cmd = text.trim().to_lowercase();
        info!("Message received text={:.80}", cmd);

        // Log-only scan; routing is never blocked.
        detect_suspicious_patterns(text);

        match self.route_message(chat_id, text, &cmd, sink).await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    "Error in handle_message chat={chat_id} kind={}: {err}",
                    err.kind()
                );
                OrchestratorResult::text("An internal error occurred. Please try again.")
            }
        }
    }

    async fn route_message(
        &self,
        chat_id: i64,
        text: &str,
        cmd: &str,
        sink: Option<&dyn StreamSink>,
    ) -> CoreResult<OrchestratorResult> {
        if let Some(command) = commands::match_command(cmd) {
            return commands::dispatch(self, command, chat_id, text).await;
        }

        let parsed = parse_directives(text, &self.known_models);
        if parsed.is_directive_only() && parsed.has_model() {
            let model = parsed.model.clone().unwrap_or_default();
            return Ok(OrchestratorResult::text(&format!(
                "Next message will use: {model}\n(Send a message with @{model} <text> to use it.)"
            )));
        }

        let prompt = if parsed.cleaned.is_empty() {
            text.trim()
        } else {
            parsed.cleaned.as_str()
        };
        flows::normal(self, chat_id, prompt, parsed.model.as_deref(), sink).await
    }

    /// One heartbeat turn in the main session. Returns alert text or None.
    pub async fn handle_heartbeat(&self, chat_id: i64) -> CoreResult<Option<String>> {
        flows::heartbeat_flow(self, chat_id).await
    }

    /// Kill every active CLI process for a chat. Returns the count killed.
    pub async fn abort(&self, chat_id: i64) -> usize {
        self.registry.kill_all(chat_id).await
    }

    pub async fn reset_session(&self, chat_id: i64) -> CoreResult<()> {
        let model = self.cli_service.default_model();
        let (model, provider) = self.resolve_runtime_target(&model)?;
        self.sessions.reset_session(chat_id, &provider, &model).await?;
        Ok(())
    }

    pub fn is_chat_busy(&self, chat_id: i64) -> bool {
        self.registry.has_active(chat_id)
    }

    /// Switch the default model, persist it, and retarget the session.
    pub async fn switch_model(&self, chat_id: i64, name: &str) -> CoreResult<OrchestratorResult> {
        let name = name.trim().to_lowercase();
        let (model, provider) = match self.resolve_runtime_target(&name) {
            Ok(target) => target,
            Err(err) => {
                warn!("Model switch rejected: {err}");
                return Ok(OrchestratorResult::text(&format!(
                    "Unknown model '{name}'. Try /model to see the options."
                )));
            }
        };

        self.cli_service.update_default_model(&model);
        let mut updates = HashMap::new();
        updates.insert("model".to_string(), Value::String(model.clone()));
        updates.insert("provider".to_string(), Value::String(provider.clone()));
        if let Err(err) = update_config_file(&self.paths.config_path(), updates) {
            warn!("Failed to persist model switch: {err}");
        }

        if let Some(mut session) = self.sessions.get_active(chat_id).await {
            self.sessions
                .sync_session_target(&mut session, Some(&provider), Some(&model))
                .await?;
        }

        info!("Model switched to {model} ({provider})");
        Ok(OrchestratorResult::text(&format!(
            "Model switched to {model} ({provider}). Takes effect with your next message."
        )))
    }
}
