//! Central path resolution for the on-disk layout.
//!
//! This is the single source of truth for every path the runtime touches.
//! All filesystem access derives from a `TetherPaths` instance.

use std::path::{Path, PathBuf};

/// Resolved, immutable paths for the runtime layout rooted at `tether_home`
/// (default `~/.tether`, overridable via config or `TETHER_HOME`).
#[derive(Debug, Clone)]
pub struct TetherPaths {
    pub tether_home: PathBuf,
}

impl TetherPaths {
    pub fn new(tether_home: PathBuf) -> Self {
        Self { tether_home }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.tether_home.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("config.json")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.tether_home.join("sessions.json")
    }

    pub fn cron_jobs_path(&self) -> PathBuf {
        self.tether_home.join("cron_jobs.json")
    }

    pub fn webhooks_path(&self) -> PathBuf {
        self.tether_home.join("webhooks.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.tether_home.join("logs")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.tether_home.join("bot.pid")
    }

    /// Empty marker file; its presence asks the supervisor for a restart.
    pub fn restart_marker_path(&self) -> PathBuf {
        self.tether_home.join("restart-requested")
    }

    pub fn workspace(&self) -> PathBuf {
        self.tether_home.join("workspace")
    }

    pub fn cron_tasks_dir(&self) -> PathBuf {
        self.workspace().join("cron_tasks")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.workspace().join("tools")
    }

    pub fn output_to_user_dir(&self) -> PathBuf {
        self.workspace().join("output_to_user")
    }

    pub fn telegram_files_dir(&self) -> PathBuf {
        self.workspace().join("telegram_files")
    }

    pub fn memory_system_dir(&self) -> PathBuf {
        self.workspace().join("memory_system")
    }

    pub fn mainmemory_path(&self) -> PathBuf {
        self.memory_system_dir().join("MAINMEMORY.md")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.workspace().join("skills")
    }
}

/// Build paths from an explicit home, the `TETHER_HOME` env var, or the
/// default `~/.tether`.
pub fn resolve_paths(tether_home: Option<&str>) -> TetherPaths {
    let home = match tether_home {
        Some(value) if !value.trim().is_empty() => expand_home(value),
        _ => match std::env::var("TETHER_HOME") {
            Ok(env_home) if !env_home.trim().is_empty() => expand_home(&env_home),
            _ => default_home(),
        },
    };
    TetherPaths::new(home)
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

fn expand_home(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if trimmed == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(trimmed)
}

/// Skill directory inside the claude CLI home, if that home exists.
pub fn claude_skills_dir() -> Option<PathBuf> {
    let claude_home = dirs::home_dir()?.join(".claude");
    claude_home.is_dir().then(|| claude_home.join("skills"))
}

/// Skill directory inside the codex CLI home (`CODEX_HOME` overridable),
/// if that home exists.
pub fn codex_skills_dir() -> Option<PathBuf> {
    let codex_home = codex_home_dir()?;
    codex_home.is_dir().then(|| codex_home.join("skills"))
}

pub fn codex_home_dir() -> Option<PathBuf> {
    match std::env::var("CODEX_HOME") {
        Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value)),
        _ => dirs::home_dir().map(|h| h.join(".codex")),
    }
}

pub fn claude_home_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".claude"))
}

impl AsRef<Path> for TetherPaths {
    fn as_ref(&self) -> &Path {
        &self.tether_home
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_paths_derive_from_home() {
        let paths = TetherPaths::new(PathBuf::from("/data/tether"));
        assert_eq!(paths.config_path(), PathBuf::from("/data/tether/config/config.json"));
        assert_eq!(paths.sessions_path(), PathBuf::from("/data/tether/sessions.json"));
        assert_eq!(
            paths.cron_tasks_dir(),
            PathBuf::from("/data/tether/workspace/cron_tasks")
        );
        assert_eq!(
            paths.mainmemory_path(),
            PathBuf::from("/data/tether/workspace/memory_system/MAINMEMORY.md")
        );
    }

    #[test]
    fn explicit_home_wins_over_default() {
        let paths = resolve_paths(Some("/tmp/custom-home"));
        assert_eq!(paths.tether_home, PathBuf::from("/tmp/custom-home"));
    }
}
