//! Runtime configuration, defaults merge, and the model registry.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::{CoreError, CoreResult};

/// Packaged defaults merged into the user's config.json on load.
pub const DEFAULT_CONFIG_JSON: &str = include_str!("../home_defaults/config.defaults.json");

fn default_log_level() -> String {
    "info".into()
}
fn default_provider() -> String {
    "claude".into()
}
fn default_model() -> String {
    "opus".into()
}
fn default_idle_timeout() -> u64 {
    1440
}
fn default_age_warning() -> u64 {
    12
}
fn default_reset_hour() -> u8 {
    4
}
fn default_permission_mode() -> String {
    "bypassPermissions".into()
}
fn default_cli_timeout() -> f64 {
    600.0
}
fn default_reasoning_effort() -> String {
    "medium".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub min_chars: usize,
    pub max_chars: usize,
    pub edit_interval_seconds: f64,
    pub max_edit_failures: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_chars: 200,
            max_chars: 4000,
            edit_interval_seconds: 2.0,
            max_edit_failures: 3,
        }
    }
}

pub const DEFAULT_HEARTBEAT_PROMPT: &str = "You are running as a background heartbeat check. Review the current workspace context:\n\
- Read memory_system/MAINMEMORY.md for user interests and personality\n\
- Check cron_tasks/ for active projects\n\
- Think about what might be useful, interesting, or fun for the user\n\
\n\
If you have a creative idea, suggestion, interesting fact, or something the user might enjoy:\n\
Reply with your message directly.\n\
\n\
If nothing needs attention right now:\n\
Reply exactly: HEARTBEAT_OK";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub cooldown_minutes: u64,
    pub quiet_start: u8,
    pub quiet_end: u8,
    pub prompt: String,
    pub ack_token: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            cooldown_minutes: 5,
            quiet_start: 21,
            quiet_end: 8,
            prompt: DEFAULT_HEARTBEAT_PROMPT.into(),
            ack_token: "HEARTBEAT_OK".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub telegram_files_days: u64,
    pub output_to_user_days: u64,
    pub check_hour: u8,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            telegram_files_days: 30,
            output_to_user_days: 30,
            check_hour: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub token: String,
    pub max_body_bytes: usize,
    pub rate_limit_per_minute: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 8742,
            token: String::new(),
            max_body_bytes: 262_144,
            rate_limit_per_minute: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliParametersConfig {
    pub claude: Vec<String>,
    pub codex: Vec<String>,
}

/// Top-level configuration loaded from config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub tether_home: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u64,
    #[serde(default = "default_age_warning")]
    pub session_age_warning_hours: u64,
    #[serde(default = "default_reset_hour")]
    pub daily_reset_hour: u8,
    pub daily_reset_enabled: bool,
    pub max_budget_usd: Option<f64>,
    pub max_turns: Option<u32>,
    pub max_session_messages: Option<u64>,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default = "default_cli_timeout")]
    pub cli_timeout: f64,
    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: String,
    pub streaming: StreamingConfig,
    pub heartbeat: HeartbeatConfig,
    pub cleanup: CleanupConfig,
    pub webhooks: WebhookConfig,
    pub cli_parameters: CliParametersConfig,
    pub user_timezone: String,
    pub telegram_token: String,
    pub allowed_user_ids: Vec<i64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            provider: default_provider(),
            model: default_model(),
            tether_home: "~/.tether".into(),
            idle_timeout_minutes: default_idle_timeout(),
            session_age_warning_hours: default_age_warning(),
            daily_reset_hour: default_reset_hour(),
            daily_reset_enabled: false,
            max_budget_usd: None,
            max_turns: None,
            max_session_messages: None,
            permission_mode: default_permission_mode(),
            cli_timeout: default_cli_timeout(),
            reasoning_effort: default_reasoning_effort(),
            streaming: StreamingConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            cleanup: CleanupConfig::default(),
            webhooks: WebhookConfig::default(),
            cli_parameters: CliParametersConfig::default(),
            user_timezone: String::new(),
            telegram_token: String::new(),
            allowed_user_ids: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load config.json, merging packaged defaults for any missing keys.
    /// Unknown user keys are preserved on disk; new default keys are written
    /// back silently.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let defaults: Value = serde_json::from_str(DEFAULT_CONFIG_JSON)
            .map_err(|e| CoreError::Infra(format!("bad packaged defaults: {e}")))?;

        let raw = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::from("{}"),
            Err(err) => return Err(CoreError::Infra(format!("read {}: {err}", path.display()))),
        };
        let user: Value = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Infra(format!("parse {}: {e}", path.display())))?;

        let (merged, changed) = deep_merge(&user, &defaults);
        if changed {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            crate::core::jsonfs::atomic_write(path, &serde_json::to_string_pretty(&merged)?)?;
            info!("Config defaults merged, new keys written to {}", path.display());
        }

        let config: AgentConfig = serde_json::from_value(merged)
            .map_err(|e| CoreError::Infra(format!("config schema: {e}")))?;
        Ok(config)
    }

    pub fn cli_timeout_secs(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.cli_timeout.max(1.0))
    }
}

/// Recursively merge `defaults` into `user`, preserving user values.
/// Returns `(merged, changed)` where `changed` is true when keys were added.
pub fn deep_merge(user: &Value, defaults: &Value) -> (Value, bool) {
    match (user, defaults) {
        (Value::Object(user_map), Value::Object(default_map)) => {
            let mut result = user_map.clone();
            let mut changed = false;
            for (key, default_val) in default_map {
                match result.get(key) {
                    None => {
                        result.insert(key.clone(), default_val.clone());
                        changed = true;
                    }
                    Some(existing) if existing.is_object() && default_val.is_object() => {
                        let (sub, sub_changed) = deep_merge(existing, default_val);
                        if sub_changed {
                            result.insert(key.clone(), sub);
                            changed = true;
                        }
                    }
                    Some(_) => {}
                }
            }
            (Value::Object(result), changed)
        }
        _ => (user.clone(), false),
    }
}

/// Update selected top-level keys in config.json without touching other
/// user settings. Writes atomically.
pub fn update_config_file(path: &Path, updates: HashMap<String, Value>) -> CoreResult<()> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Infra(format!("read {}: {e}", path.display())))?;
    let mut data: Value = serde_json::from_str(&raw)?;
    if let Some(map) = data.as_object_mut() {
        for (key, value) in updates {
            map.insert(key, value);
        }
    }
    crate::core::jsonfs::atomic_write(path, &serde_json::to_string_pretty(&data)?)?;
    Ok(())
}

/// Resolve the user timezone: config value -> `TZ` env -> /etc/localtime -> UTC.
pub fn resolve_user_timezone(configured: &str) -> Tz {
    let trimmed = configured.trim();
    if !trimmed.is_empty() {
        match Tz::from_str(trimmed) {
            Ok(tz) => return tz,
            Err(_) => warn!("Invalid user_timezone '{}', falling back to host/UTC", trimmed),
        }
    }

    if let Ok(env_tz) = std::env::var("TZ") {
        if let Ok(tz) = Tz::from_str(env_tz.trim()) {
            return tz;
        }
    }

    // Linux: /etc/localtime is a symlink into the zoneinfo database.
    if let Ok(target) = std::fs::read_link("/etc/localtime") {
        let target = target.to_string_lossy().to_string();
        if let Some(idx) = target.find("/zoneinfo/") {
            let candidate = &target[idx + "/zoneinfo/".len()..];
            if let Ok(tz) = Tz::from_str(candidate) {
                return tz;
            }
        }
    }

    Tz::UTC
}

const CLAUDE_MODELS: [&str; 3] = ["haiku", "sonnet", "opus"];

/// Cross-provider equivalents used when the requested provider is not
/// authenticated.
fn model_equivalent(model: &str) -> Option<&'static str> {
    match model {
        "opus" => Some("gpt-5.2-codex"),
        "sonnet" | "haiku" => Some("gpt-5.1-codex-mini"),
        "gpt-5.2-codex" | "gpt-5.1-codex-max" | "gpt-5.2" | "gpt-5.3-codex" => Some("opus"),
        "gpt-5.1-codex-mini" => Some("sonnet"),
        _ => None,
    }
}

/// Provider resolution for model names. Claude models are a fixed set;
/// everything else routes to codex.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry;

impl ModelRegistry {
    pub fn is_claude_model(model: &str) -> bool {
        CLAUDE_MODELS.contains(&model)
    }

    pub fn provider_for(model: &str) -> &'static str {
        if Self::is_claude_model(model) {
            "claude"
        } else {
            "codex"
        }
    }

    pub fn known_claude_models() -> &'static [&'static str] {
        &CLAUDE_MODELS
    }

    /// Resolve `model` to `(model, provider)`, falling back through the
    /// equivalence map and finally to any available provider.
    pub fn resolve_for_provider(
        &self,
        model: &str,
        available: &[String],
    ) -> CoreResult<(String, String)> {
        let native = Self::provider_for(model);
        if available.iter().any(|p| p == native) {
            return Ok((model.to_string(), native.to_string()));
        }

        if let Some(equivalent) = model_equivalent(model) {
            let eq_provider = Self::provider_for(equivalent);
            if available.iter().any(|p| p == eq_provider) {
                info!(
                    "Model fallback: {} ({}) -> {} ({})",
                    model, native, equivalent, eq_provider
                );
                return Ok((equivalent.to_string(), eq_provider.to_string()));
            }
        }

        if let Some(fallback) = available.first() {
            let fallback_model = if fallback == "claude" { "opus" } else { model };
            warn!(
                "No equivalent for '{}', falling back to {} ({})",
                model, fallback_model, fallback
            );
            return Ok((fallback_model.to_string(), fallback.clone()));
        }

        Err(CoreError::Cli(format!(
            "no available provider for model '{model}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_adds_missing_keys_only() {
        let user = json!({"model": "sonnet", "webhooks": {"port": 9000}});
        let defaults = json!({"model": "opus", "provider": "claude", "webhooks": {"port": 8742, "enabled": false}});
        let (merged, changed) = deep_merge(&user, &defaults);
        assert!(changed);
        assert_eq!(merged["model"], "sonnet");
        assert_eq!(merged["provider"], "claude");
        assert_eq!(merged["webhooks"]["port"], 9000);
        assert_eq!(merged["webhooks"]["enabled"], false);
    }

    #[test]
    fn deep_merge_reports_unchanged() {
        let user = json!({"a": 1, "b": {"c": 2}});
        let defaults = json!({"a": 0, "b": {"c": 9}});
        let (_, changed) = deep_merge(&user, &defaults);
        assert!(!changed);
    }

    #[test]
    fn provider_for_routes_unknown_models_to_codex() {
        assert_eq!(ModelRegistry::provider_for("opus"), "claude");
        assert_eq!(ModelRegistry::provider_for("gpt-5.2-codex"), "codex");
    }

    #[test]
    fn resolve_prefers_native_provider() {
        let reg = ModelRegistry;
        let (model, provider) = reg
            .resolve_for_provider("opus", &["claude".into(), "codex".into()])
            .unwrap();
        assert_eq!((model.as_str(), provider.as_str()), ("opus", "claude"));
    }

    #[test]
    fn resolve_falls_back_through_equivalence() {
        let reg = ModelRegistry;
        let (model, provider) = reg.resolve_for_provider("opus", &["codex".into()]).unwrap();
        assert_eq!(model, "gpt-5.2-codex");
        assert_eq!(provider, "codex");
    }

    #[test]
    fn resolve_errors_with_no_providers() {
        let reg = ModelRegistry;
        assert!(reg.resolve_for_provider("opus", &[]).is_err());
    }

    #[test]
    fn packaged_defaults_parse_into_config() {
        let defaults: Value = serde_json::from_str(DEFAULT_CONFIG_JSON).unwrap();
        let config: AgentConfig = serde_json::from_value(defaults).unwrap();
        assert_eq!(config.provider, "claude");
        assert_eq!(config.webhooks.port, 8742);
    }
}
