//! Runtime assembly: builds the stores, the orchestrator, the observers,
//! and runs the Telegram dispatcher until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::Bot;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, ModelRegistry};
use crate::core::cleanup::CleanupObserver;
use crate::core::cli::auth::{check_all_auth, AuthStatus};
use crate::core::cli::registry::ProcessRegistry;
use crate::core::cli::service::{CliService, CliServiceConfig};
use crate::core::cron::dependency::DependencyQueue;
use crate::core::cron::scheduler::CronObserver;
use crate::core::cron::store::CronStore;
use crate::core::heartbeat::{HeartbeatHandler, HeartbeatObserver};
use crate::core::notify::Notifier;
use crate::core::orchestrator::Orchestrator;
use crate::core::paths::{resolve_paths, TetherPaths};
use crate::core::session::SessionStore;
use crate::core::webhook::observer::WebhookObserver;
use crate::core::webhook::store::WebhookStore;
use crate::core::workspace::{init as workspace_init, skills};
use crate::errors::CoreResult;
use crate::interfaces::gate::ChatGate;
use crate::interfaces::telegram::{
    run_dispatcher, AppState, TelegramNotifier, TelegramWake,
};

/// Adapter so the heartbeat observer drives the orchestrator flow.
struct OrchestratorHeartbeat {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl HeartbeatHandler for OrchestratorHeartbeat {
    async fn heartbeat(&self, chat_id: i64) -> CoreResult<Option<String>> {
        self.orchestrator.handle_heartbeat(chat_id).await
    }
}

fn acquire_pid_lock(paths: &TetherPaths) -> Result<()> {
    let pid_path = paths.pid_path();
    if let Ok(existing) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if process_alive(pid) {
                anyhow::bail!(
                    "another instance is already running (pid {pid}, {})",
                    pid_path.display()
                );
            }
            warn!("Removing stale pid file (pid {pid} is gone)");
        }
    }
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())?;
    Ok(())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn process_alive(_pid: u32) -> bool {
    false
}

fn release_pid_lock(paths: &TetherPaths) {
    let _ = std::fs::remove_file(paths.pid_path());
}

/// Run the bot process: load config, initialize the workspace, start all
/// observers, and drive the dispatcher until shutdown.
pub async fn run_bot() -> Result<()> {
    // Bootstrap paths come from the environment/default; the configured
    // home (if different) wins after the config is loaded.
    let bootstrap_paths = resolve_paths(None);
    let config = AgentConfig::load(&bootstrap_paths.config_path())
        .with_context(|| format!("loading {}", bootstrap_paths.config_path().display()))?;
    crate::logging::init_logging(&config.log_level);

    let paths = resolve_paths(Some(&config.tether_home));
    let config = Arc::new(config);

    if config.telegram_token.trim().is_empty() {
        anyhow::bail!(
            "telegram_token is not configured; set it in {}",
            paths.config_path().display()
        );
    }
    if config.allowed_user_ids.is_empty() {
        warn!("allowed_user_ids is empty -- every incoming message will be dropped");
    }

    acquire_pid_lock(&paths)?;

    {
        let paths = paths.clone();
        tokio::task::spawn_blocking(move || workspace_init::init_workspace(&paths))
            .await?
            .map_err(|e| anyhow::anyhow!("workspace init: {e}"))?;
    }
    workspace_init::inject_runtime_environment(&paths, None);

    // Stores and the process registry.
    let sessions = Arc::new(SessionStore::new(paths.sessions_path(), config.clone()));
    let registry = Arc::new(ProcessRegistry::new());
    let cron_store = Arc::new(CronStore::new(paths.cron_jobs_path()));
    let webhook_store = Arc::new(WebhookStore::new(paths.webhooks_path()));
    let dep_queue = Arc::new(DependencyQueue::new());

    let cli_service = Arc::new(CliService::new(
        CliServiceConfig {
            working_dir: paths.workspace(),
            default_model: config.model.clone(),
            provider: config.provider.clone(),
            max_turns: config.max_turns,
            max_budget_usd: config.max_budget_usd,
            permission_mode: config.permission_mode.clone(),
            reasoning_effort: config.reasoning_effort.clone(),
            claude_cli_parameters: config.cli_parameters.claude.clone(),
            codex_cli_parameters: config.cli_parameters.codex.clone(),
        },
        ModelRegistry,
        registry.clone(),
    ));

    // Provider auth discovery feeds the fallback logic.
    let auth_results = tokio::task::spawn_blocking(check_all_auth).await?;
    let mut available = Vec::new();
    for result in &auth_results {
        match result.status {
            AuthStatus::Authenticated => {
                info!("Provider [{}]: authenticated", result.provider);
                available.push(result.provider.to_string());
            }
            AuthStatus::Installed => {
                warn!("Provider [{}]: installed but NOT authenticated", result.provider)
            }
            AuthStatus::NotFound => info!("Provider [{}]: not found", result.provider),
        }
    }
    if available.is_empty() {
        error!("No authenticated providers found! CLI calls will fail.");
    } else {
        info!("Available providers: {}", available.join(", "));
    }
    cli_service.update_available_providers(available);

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        paths.clone(),
        sessions,
        registry.clone(),
        cli_service,
        cron_store.clone(),
        webhook_store.clone(),
    ));

    // Chat transport and the delivery seams.
    let bot = Bot::new(config.telegram_token.clone());
    let gate = Arc::new(ChatGate::new());
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(
        bot.clone(),
        config.allowed_user_ids.clone(),
    ));
    let wake_handler = Arc::new(TelegramWake::new(
        bot.clone(),
        gate.clone(),
        orchestrator.clone(),
    ));

    // Observers share the executor; each guards its own ticks.
    let cron_observer = Arc::new(CronObserver::new(
        paths.clone(),
        cron_store,
        config.clone(),
        dep_queue.clone(),
        notifier.clone(),
    ));
    cron_observer.start().await;

    let webhook_observer = Arc::new(WebhookObserver::new(
        paths.clone(),
        webhook_store,
        config.clone(),
        dep_queue,
        notifier.clone(),
        wake_handler,
    ));
    if let Err(err) = webhook_observer.start().await {
        error!("Webhook observer failed to start: {err}");
    }

    let heartbeat_observer = Arc::new(HeartbeatObserver::new(
        config.clone(),
        registry,
        Arc::new(OrchestratorHeartbeat {
            orchestrator: orchestrator.clone(),
        }),
        notifier,
    ));
    heartbeat_observer.start().await;

    let cleanup_observer = Arc::new(CleanupObserver::new(config.clone(), paths.clone()));
    cleanup_observer.start().await;

    let rule_watcher = tokio::spawn(workspace_init::watch_rule_files(paths.workspace()));
    let skill_watcher = tokio::spawn(skills::watch_skill_sync(paths.clone()));
    info!("Rule and skill watchers started");

    // The agent (or a helper tool) can touch this marker to request a
    // restart; the supervisor respawns immediately on exit code 42.
    let restart_marker = paths.restart_marker_path();
    let restart_watcher = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            if restart_marker.exists() {
                let _ = std::fs::remove_file(&restart_marker);
                info!("Restart requested via marker file, exiting with code 42");
                std::process::exit(crate::supervisor::EXIT_RESTART);
            }
        }
    });

    let state = Arc::new(AppState {
        bot,
        config: config.clone(),
        orchestrator,
        gate,
    });
    run_dispatcher(state).await;

    // Orderly shutdown.
    info!("Shutting down observers");
    rule_watcher.abort();
    skill_watcher.abort();
    restart_watcher.abort();
    cron_observer.stop().await;
    webhook_observer.stop().await;
    heartbeat_observer.stop().await;
    cleanup_observer.stop().await;
    skills::shutdown_cleanup(&paths);
    release_pid_lock(&paths);
    info!("Shutdown complete");
    Ok(())
}
