//! Execution-config resolution: task overrides layered over the global
//! config, with model validation against the provider's known set.

use std::path::PathBuf;

use crate::config::{AgentConfig, ModelRegistry};
use crate::errors::{CoreError, CoreResult};

/// Per-task overrides carried by cron jobs and webhook entries.
#[derive(Debug, Clone, Default)]
pub struct TaskOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub cli_parameters: Vec<String>,
}

/// Resolved, validated configuration for a single one-shot execution.
#[derive(Debug, Clone)]
pub struct TaskExecutionConfig {
    pub provider: String,
    pub model: String,
    pub reasoning_effort: String,
    pub cli_parameters: Vec<String>,
    pub permission_mode: String,
    pub working_dir: PathBuf,
}

/// Layer overrides over the global config. Overrides win whole-field:
/// a task's `cli_parameters` replace the global list, never concatenate.
pub fn resolve_cli_config(
    config: &AgentConfig,
    working_dir: PathBuf,
    overrides: &TaskOverrides,
) -> CoreResult<TaskExecutionConfig> {
    let provider = overrides
        .provider
        .clone()
        .unwrap_or_else(|| config.provider.clone());
    let model = overrides.model.clone().unwrap_or_else(|| config.model.clone());

    if provider == "claude" && !ModelRegistry::is_claude_model(&model) {
        return Err(CoreError::Scheduler(format!(
            "invalid claude model: {model} (known: {})",
            ModelRegistry::known_claude_models().join(", ")
        )));
    }

    // Reasoning effort only applies to codex.
    let reasoning_effort = if provider == "codex" {
        overrides
            .reasoning_effort
            .clone()
            .unwrap_or_else(|| config.reasoning_effort.clone())
    } else {
        String::new()
    };

    let cli_parameters = if !overrides.cli_parameters.is_empty() {
        overrides.cli_parameters.clone()
    } else {
        match provider.as_str() {
            "codex" => config.cli_parameters.codex.clone(),
            _ => config.cli_parameters.claude.clone(),
        }
    };

    Ok(TaskExecutionConfig {
        provider,
        model,
        reasoning_effort,
        cli_parameters,
        permission_mode: config.permission_mode.clone(),
        working_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_whole_field() {
        let mut config = AgentConfig::default();
        config.cli_parameters.claude = vec!["--global-flag".into()];
        let overrides = TaskOverrides {
            model: Some("sonnet".into()),
            cli_parameters: vec!["--task-flag".into()],
            ..Default::default()
        };
        let resolved = resolve_cli_config(&config, PathBuf::from("/w"), &overrides).unwrap();
        assert_eq!(resolved.model, "sonnet");
        // No concatenation with the global list.
        assert_eq!(resolved.cli_parameters, vec!["--task-flag".to_string()]);
    }

    #[test]
    fn global_parameters_apply_without_overrides() {
        let mut config = AgentConfig::default();
        config.cli_parameters.claude = vec!["--global-flag".into()];
        let resolved =
            resolve_cli_config(&config, PathBuf::from("/w"), &TaskOverrides::default()).unwrap();
        assert_eq!(resolved.cli_parameters, vec!["--global-flag".to_string()]);
    }

    #[test]
    fn invalid_claude_model_rejected() {
        let config = AgentConfig::default();
        let overrides = TaskOverrides {
            model: Some("gpt-5.2-codex".into()),
            ..Default::default()
        };
        assert!(resolve_cli_config(&config, PathBuf::from("/w"), &overrides).is_err());
    }

    #[test]
    fn reasoning_effort_cleared_for_claude() {
        let config = AgentConfig::default();
        let resolved =
            resolve_cli_config(&config, PathBuf::from("/w"), &TaskOverrides::default()).unwrap();
        assert!(resolved.reasoning_effort.is_empty());

        let overrides = TaskOverrides {
            provider: Some("codex".into()),
            model: Some("gpt-5.2-codex".into()),
            ..Default::default()
        };
        let resolved = resolve_cli_config(&config, PathBuf::from("/w"), &overrides).unwrap();
        assert_eq!(resolved.reasoning_effort, "medium");
    }
}
