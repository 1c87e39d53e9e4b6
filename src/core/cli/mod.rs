//! CLI subprocess layer: provider wrappers, normalized stream events,
//! process registry, and the unified service gateway.

pub mod auth;
pub mod claude;
pub mod codex;
pub mod codex_events;
pub mod events;
pub mod params;
pub mod registry;
pub mod service;
mod spawn;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use self::events::StreamEvent;
use self::registry::ProcessRegistry;
use self::types::CliResponse;
use crate::errors::CoreResult;

/// Configuration for any provider wrapper.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub provider: String,
    pub working_dir: PathBuf,
    pub model: String,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub permission_mode: String,
    pub reasoning_effort: String,
    pub cli_parameters: Vec<String>,
    pub chat_id: i64,
    pub process_label: String,
    pub registry: Arc<ProcessRegistry>,
}

/// Abstract interface for CLI backends (claude, codex).
#[async_trait]
pub trait ProviderCli: Send + Sync {
    /// Send a prompt and return the final result.
    async fn send(
        &self,
        prompt: &str,
        resume_session: Option<&str>,
        continue_session: bool,
        timeout: Option<Duration>,
    ) -> CoreResult<CliResponse>;

    /// Send a prompt and stream normalized events. The channel yields
    /// events in arrival order; a `Result` event ends a clean stream.
    async fn send_streaming(
        &self,
        prompt: &str,
        resume_session: Option<&str>,
        timeout: Option<Duration>,
    ) -> CoreResult<mpsc::Receiver<StreamEvent>>;
}

/// Instantiate the wrapper for the configured provider.
pub fn create_cli(config: CliConfig) -> CoreResult<Box<dyn ProviderCli>> {
    match config.provider.as_str() {
        "codex" => Ok(Box::new(codex::CodexCli::new(config)?)),
        _ => Ok(Box::new(claude::ClaudeCli::new(config)?)),
    }
}
