//! CLIService: unified gateway for every CLI call in the process.
//!
//! No retry/backoff, no circuit breaker. The one retry in the system
//! (resume failure) lives in the orchestrator flows.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use super::events::{ResultEvent, StreamEvent};
use super::registry::ProcessRegistry;
use super::types::{cli_to_agent_response, AgentRequest, AgentResponse, CliResponse};
use super::{create_cli, CliConfig, ProviderCli};
use crate::config::ModelRegistry;
use crate::errors::CoreResult;

/// Consumer of normalized stream events. Events for one request arrive in
/// stream order; the result is returned from the call, not the sink.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_text_delta(&self, chunk: &str);
    async fn on_tool_activity(&self, tool_name: &str);
    async fn on_system_status(&self, status: Option<&str>);
}

/// A sink that ignores everything; used by non-interactive callers.
pub struct NullSink;

#[async_trait]
impl StreamSink for NullSink {
    async fn on_text_delta(&self, _chunk: &str) {}
    async fn on_tool_activity(&self, _tool_name: &str) {}
    async fn on_system_status(&self, _status: Option<&str>) {}
}

/// Static wiring the service needs from the orchestrator.
#[derive(Debug, Clone)]
pub struct CliServiceConfig {
    pub working_dir: PathBuf,
    pub default_model: String,
    pub provider: String,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub permission_mode: String,
    pub reasoning_effort: String,
    pub claude_cli_parameters: Vec<String>,
    pub codex_cli_parameters: Vec<String>,
}

impl CliServiceConfig {
    fn cli_parameters_for_provider(&self, provider: &str) -> Vec<String> {
        if provider == "codex" {
            self.codex_cli_parameters.clone()
        } else {
            self.claude_cli_parameters.clone()
        }
    }
}

pub struct CliService {
    config: RwLock<CliServiceConfig>,
    models: ModelRegistry,
    available_providers: RwLock<Vec<String>>,
    registry: Arc<ProcessRegistry>,
}

impl CliService {
    pub fn new(
        config: CliServiceConfig,
        models: ModelRegistry,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            models,
            available_providers: RwLock::new(Vec::new()),
            registry,
        }
    }

    pub fn update_available_providers(&self, providers: Vec<String>) {
        *self.available_providers.write().expect("providers lock") = providers;
    }

    pub fn available_providers(&self) -> Vec<String> {
        self.available_providers.read().expect("providers lock").clone()
    }

    /// Update the default model after a /model switch.
    pub fn update_default_model(&self, model: &str) {
        self.config.write().expect("config lock").default_model = model.to_string();
    }

    pub fn default_model(&self) -> String {
        self.config.read().expect("config lock").default_model.clone()
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Resolve the effective `(model, provider)` for a request.
    pub fn resolve_target(&self, request: &AgentRequest) -> CoreResult<(String, String)> {
        let model = request
            .model_override
            .clone()
            .unwrap_or_else(|| self.default_model());
        if let Some(provider) = &request.provider_override {
            return Ok((model, provider.clone()));
        }
        let available = self.available_providers();
        if available.is_empty() {
            let provider = ModelRegistry::provider_for(&model).to_string();
            return Ok((model, provider));
        }
        self.models.resolve_for_provider(&model, &available)
    }

    pub async fn execute(&self, request: &AgentRequest) -> CoreResult<AgentResponse> {
        let cli = self.make_cli(request)?;
        info!(
            "CLI execute starting label={} model={}",
            request.process_label,
            request.model_override.as_deref().unwrap_or("<default>"),
        );

        let t0 = Instant::now();
        let response = cli
            .send(
                &request.prompt,
                request.resume_session.as_deref(),
                request.continue_session,
                request.timeout,
            )
            .await?;
        let elapsed_ms = t0.elapsed().as_millis();

        let agent_resp = cli_to_agent_response(response, false);
        info!(
            "CLI {} [{}] cost=${:.4} tokens={} duration_ms={}",
            request.process_label,
            if agent_resp.is_error { "error" } else { "ok" },
            agent_resp.cost_usd,
            agent_resp.total_tokens,
            elapsed_ms,
        );
        Ok(agent_resp)
    }

    /// Streaming execution with automatic fallback to non-streaming.
    pub async fn execute_streaming(
        &self,
        request: &AgentRequest,
        sink: &dyn StreamSink,
    ) -> CoreResult<AgentResponse> {
        let cli = self.make_cli(request)?;
        info!(
            "CLI streaming starting label={} model={}",
            request.process_label,
            request.model_override.as_deref().unwrap_or("<default>"),
        );

        let mut accumulated = String::new();
        let mut result_event: Option<ResultEvent> = None;

        let mut rx = cli
            .send_streaming(&request.prompt, request.resume_session.as_deref(), request.timeout)
            .await?;

        while let Some(event) = rx.recv().await {
            if self.registry.was_aborted(request.chat_id) {
                info!("Streaming aborted mid-stream chat={}", request.chat_id);
                break;
            }
            match event {
                StreamEvent::TextDelta { text } => {
                    accumulated.push_str(&text);
                    sink.on_text_delta(&text).await;
                }
                StreamEvent::Thinking => sink.on_system_status(Some("thinking")).await,
                StreamEvent::ToolUse { tool_name } => sink.on_tool_activity(&tool_name).await,
                StreamEvent::SystemStatus { status } => {
                    sink.on_system_status(status.as_deref()).await
                }
                StreamEvent::CompactBoundary { trigger, pre_tokens } => {
                    info!("Context compacted (trigger={}, pre_tokens={})", trigger, pre_tokens);
                    sink.on_system_status(None).await;
                }
                StreamEvent::SystemInit { .. } => {}
                StreamEvent::Result(result) => {
                    result_event = Some(result);
                }
            }
        }
        drop(rx);

        let Some(result) = result_event else {
            return self.handle_stream_fallback(request, accumulated).await;
        };

        info!("CLI streaming completed label={}", request.process_label);
        let cli_resp = CliResponse {
            session_id: result.session_id,
            result: if result.result.is_empty() {
                accumulated
            } else {
                result.result
            },
            is_error: result.is_error,
            returncode: result.returncode,
            duration_ms: result.duration_ms,
            duration_api_ms: result.duration_api_ms,
            total_cost_usd: result.total_cost_usd,
            usage: result.usage,
            num_turns: result.num_turns,
            ..Default::default()
        };
        Ok(cli_to_agent_response(cli_resp, false))
    }

    /// The stream ended without a result event: aborted -> empty; text
    /// accumulated -> synthesize; otherwise retry once non-streaming and
    /// flag the response for telemetry.
    async fn handle_stream_fallback(
        &self,
        request: &AgentRequest,
        accumulated: String,
    ) -> CoreResult<AgentResponse> {
        let was_aborted = self.registry.was_aborted(request.chat_id);
        info!(
            "Stream fallback: aborted={} accumulated={}",
            was_aborted,
            accumulated.len()
        );

        if was_aborted {
            return Ok(AgentResponse::default());
        }

        if !accumulated.is_empty() {
            info!(
                "Stream completed without result event, using {} chars",
                accumulated.len()
            );
            return Ok(AgentResponse {
                result: accumulated,
                ..Default::default()
            });
        }

        warn!("Streaming produced nothing, retrying non-streaming");
        let resp = self.execute(request).await?;
        Ok(AgentResponse {
            stream_fallback: true,
            ..resp
        })
    }

    fn make_cli(&self, request: &AgentRequest) -> CoreResult<Box<dyn ProviderCli>> {
        let (model, provider) = self.resolve_target(request)?;
        let config = self.config.read().expect("config lock").clone();
        create_cli(CliConfig {
            cli_parameters: config.cli_parameters_for_provider(&provider),
            provider,
            working_dir: config.working_dir,
            model,
            system_prompt: request.system_prompt.clone(),
            append_system_prompt: request.append_system_prompt.clone(),
            max_turns: config.max_turns,
            max_budget_usd: config.max_budget_usd,
            permission_mode: config.permission_mode,
            reasoning_effort: config.reasoning_effort,
            chat_id: request.chat_id,
            process_label: request.process_label.clone(),
            registry: self.registry.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with(providers: Vec<String>) -> CliService {
        let service = CliService::new(
            CliServiceConfig {
                working_dir: PathBuf::from("/w"),
                default_model: "opus".into(),
                provider: "claude".into(),
                max_turns: None,
                max_budget_usd: None,
                permission_mode: "bypassPermissions".into(),
                reasoning_effort: "medium".into(),
                claude_cli_parameters: Vec::new(),
                codex_cli_parameters: Vec::new(),
            },
            ModelRegistry,
            Arc::new(ProcessRegistry::new()),
        );
        service.update_available_providers(providers);
        service
    }

    #[test]
    fn target_resolution_uses_override_then_default() {
        let service = service_with(vec!["claude".into(), "codex".into()]);
        let request = AgentRequest {
            model_override: Some("sonnet".into()),
            ..Default::default()
        };
        let (model, provider) = service.resolve_target(&request).unwrap();
        assert_eq!((model.as_str(), provider.as_str()), ("sonnet", "claude"));

        let request = AgentRequest::default();
        let (model, _) = service.resolve_target(&request).unwrap();
        assert_eq!(model, "opus");
    }

    #[test]
    fn target_resolution_falls_back_when_unauthenticated() {
        let service = service_with(vec!["codex".into()]);
        let (model, provider) = service.resolve_target(&AgentRequest::default()).unwrap();
        assert_eq!(model, "gpt-5.2-codex");
        assert_eq!(provider, "codex");
    }

    #[test]
    fn provider_override_short_circuits() {
        let service = service_with(vec!["claude".into()]);
        let request = AgentRequest {
            model_override: Some("gpt-5.2-codex".into()),
            provider_override: Some("codex".into()),
            ..Default::default()
        };
        let (model, provider) = service.resolve_target(&request).unwrap();
        assert_eq!(model, "gpt-5.2-codex");
        assert_eq!(provider, "codex");
    }
}
