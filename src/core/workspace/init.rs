//! Workspace initialization: embedded-template seeding with zone rules,
//! rule-file pairing, config merge, orphan-link cleanup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use include_dir::{include_dir, Dir};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::jsonfs;
use crate::core::paths::TetherPaths;
use crate::errors::CoreResult;

/// Bundled template mirroring the `~/.tether` tree.
static HOME_DEFAULTS: Dir = include_dir!("$CARGO_MANIFEST_DIR/home_defaults");

/// Rule files both agent CLIs read; kept in lockstep by the pairing sync.
const RULE_FILES: [&str; 2] = ["CLAUDE.md", "AGENTS.md"];

const SKIP_DIRS: [&str; 5] = [".git", ".venv", ".mypy_cache", "__pycache__", "node_modules"];

/// Top-level template entries that are loader inputs, not workspace files.
const SKIP_FILES: [&str; 1] = ["config.defaults.json"];

const RULE_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Always-overwrite set: rule files plus the framework helper tools for
/// cron and webhooks. Everything else is seeded once and then user-owned.
fn is_zone_always(relative: &Path) -> bool {
    let name = relative
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if RULE_FILES.contains(&name) {
        return true;
    }
    let rel = relative.to_string_lossy();
    rel.starts_with("workspace/tools/cron_tools/")
        || rel.starts_with("workspace/tools/webhook_tools/")
}

fn write_template_file(target: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, contents)
}

fn sync_dir(dir: &Dir<'_>, home: &Path) {
    for sub in dir.dirs() {
        let name = sub
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.starts_with('.') || SKIP_DIRS.contains(&name) {
            continue;
        }
        sync_dir(sub, home);
    }
    for file in dir.files() {
        let relative = file.path();
        let name = relative
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.starts_with('.') || SKIP_FILES.contains(&name) {
            continue;
        }
        let target = home.join(relative);

        // Bundled links are preserved; never write through a symlink.
        if target.is_symlink() && !is_zone_always(relative) {
            debug!("Zone skip (symlink): {}", target.display());
            continue;
        }

        if is_zone_always(relative) {
            if target.is_symlink() {
                let _ = std::fs::remove_file(&target);
            }
            if let Err(err) = write_template_file(&target, file.contents()) {
                warn!("Template write failed {}: {err}", target.display());
                continue;
            }
            debug!("Zone-always copy: {}", target.display());
            // Every CLAUDE.md gets a matching AGENTS.md mirror so both
            // agent CLIs see the same rules from the first start.
            if name == "CLAUDE.md" {
                let agents = target.with_file_name("AGENTS.md");
                if agents.is_symlink() {
                    let _ = std::fs::remove_file(&agents);
                }
                if let Err(err) = write_template_file(&agents, file.contents()) {
                    warn!("Template write failed {}: {err}", agents.display());
                }
            }
        } else if !target.exists() {
            if let Err(err) = write_template_file(&target, file.contents()) {
                warn!("Template write failed {}: {err}", target.display());
            } else {
                debug!("Zone-once seed: {}", target.display());
            }
        } else {
            debug!("Zone-once skip: {} (exists)", target.display());
        }
    }
}

/// Pair CLAUDE.md <-> AGENTS.md in one directory: a lone file is copied to
/// its sibling name; when both exist, the newer mtime wins.
fn sync_pair(directory: &Path) {
    let claude = directory.join("CLAUDE.md");
    let agents = directory.join("AGENTS.md");

    let copy = |from: &Path, to: &Path| {
        if let Err(err) = std::fs::copy(from, to) {
            warn!("Rule pair copy failed {} -> {}: {err}", from.display(), to.display());
        }
    };

    match (claude.exists(), agents.exists()) {
        (true, false) => copy(&claude, &agents),
        (false, true) => copy(&agents, &claude),
        (true, true) => {
            let claude_mtime = std::fs::metadata(&claude).and_then(|m| m.modified()).ok();
            let agents_mtime = std::fs::metadata(&agents).and_then(|m| m.modified()).ok();
            if let (Some(c), Some(a)) = (claude_mtime, agents_mtime) {
                if c > a {
                    copy(&claude, &agents);
                } else if a > c {
                    copy(&agents, &claude);
                }
            }
        }
        (false, false) => {}
    }
}

/// Recursively pair rule files across every directory under `root`.
pub fn sync_rule_files(root: &Path) {
    if !root.is_dir() {
        return;
    }
    sync_pair(root);
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !path.is_dir() || path.is_symlink() {
                continue;
            }
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            sync_pair(&path);
            stack.push(path);
        }
    }
}

/// Merge packaged defaults into config.json at the top level only,
/// writing back only when new keys were added.
fn smart_merge_config(paths: &TetherPaths) {
    let defaults: Value = match serde_json::from_str(crate::config::DEFAULT_CONFIG_JSON) {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to parse packaged config defaults: {err}");
            return;
        }
    };

    let config_path = paths.config_path();
    if !config_path.exists() {
        if let Err(err) = jsonfs::atomic_write(
            &config_path,
            &serde_json::to_string_pretty(&defaults).unwrap_or_default(),
        ) {
            warn!("Failed to seed config.json: {err}");
        }
        return;
    }

    let existing: Value = match std::fs::read_to_string(&config_path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
    {
        Some(value) => value,
        None => {
            warn!("Failed to parse {}, skipping merge", config_path.display());
            return;
        }
    };

    // Top-level merge only; nested structures stay user-owned here.
    let (Value::Object(mut merged), Value::Object(default_map)) = (existing, defaults) else {
        return;
    };
    let mut changed = false;
    for (key, value) in default_map {
        if !merged.contains_key(&key) {
            merged.insert(key, value);
            changed = true;
        }
    }
    if changed {
        if let Err(err) = jsonfs::atomic_write(
            &config_path,
            &serde_json::to_string_pretty(&Value::Object(merged)).unwrap_or_default(),
        ) {
            warn!("Failed to write merged config: {err}");
        }
    }
}

/// One-time migration of the legacy `tasks` directory name.
fn migrate_tasks_dir(paths: &TetherPaths) {
    let old_tasks = paths.workspace().join("tasks");
    if old_tasks.is_dir() && !paths.cron_tasks_dir().exists() {
        if let Err(err) = std::fs::rename(&old_tasks, paths.cron_tasks_dir()) {
            warn!("Failed to migrate tasks/ -> cron_tasks/: {err}");
        } else {
            info!("Migrated workspace/tasks/ -> workspace/cron_tasks/");
        }
    }
}

fn clean_orphan_symlinks(workspace: &Path) {
    let Ok(entries) = std::fs::read_dir(workspace) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_symlink() && !path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }
}

fn ensure_required_dirs(paths: &TetherPaths) {
    for dir in [
        paths.logs_dir(),
        paths.config_dir(),
        paths.workspace(),
        paths.cron_tasks_dir(),
        paths.tools_dir().join("user_tools"),
        paths.output_to_user_dir(),
        paths.telegram_files_dir(),
        paths.memory_system_dir(),
        paths.skills_dir(),
    ] {
        if let Err(err) = std::fs::create_dir_all(&dir) {
            warn!("Failed to create {}: {err}", dir.display());
        }
    }
}

/// Initialize the workspace. Idempotent; safe to call on every start.
pub fn init_workspace(paths: &TetherPaths) -> CoreResult<()> {
    info!("Workspace init started home={}", paths.tether_home.display());
    migrate_tasks_dir(paths);
    sync_dir(&HOME_DEFAULTS, &paths.tether_home);
    ensure_required_dirs(paths);
    sync_rule_files(&paths.workspace());
    smart_merge_config(paths);
    clean_orphan_symlinks(&paths.workspace());
    super::skills::sync_skills(paths);
    info!("Workspace init completed");
    Ok(())
}

const SANDBOX_NOTICE: &str = "\n\n---\n\n## Runtime Environment\n\n**IMPORTANT: YOU ARE RUNNING INSIDE A SANDBOX ({label}).**\n\n- Your filesystem is isolated from the host.\n- Feel free to experiment -- the host is protected.\n";

const HOST_NOTICE: &str = "\n\n---\n\n## Runtime Environment\n\n**WARNING: YOU ARE RUNNING DIRECTLY ON THE HOST SYSTEM. THERE IS NO SANDBOX.**\n\n- Every file operation, command, and script runs on the user's real machine.\n- Be careful with destructive commands (`rm -rf`, `chmod`, etc.).\n- Ask before touching anything outside `workspace/`.\n";

/// Append the runtime-environment section to both workspace rule files.
/// Idempotent: skipped when the marker heading is already present.
pub fn inject_runtime_environment(paths: &TetherPaths, sandbox: Option<&str>) {
    let notice = match sandbox {
        Some(label) => SANDBOX_NOTICE.replace("{label}", label),
        None => HOST_NOTICE.to_string(),
    };
    for name in RULE_FILES {
        let target = paths.workspace().join(name);
        let Ok(content) = std::fs::read_to_string(&target) else {
            continue;
        };
        if content.contains("## Runtime Environment") {
            continue;
        }
        if let Err(err) = std::fs::write(&target, content + &notice) {
            warn!("Failed to inject runtime notice into {}: {err}", target.display());
        }
    }
    info!(
        "Runtime environment injected: {}",
        if sandbox.is_some() { "sandbox" } else { "host" }
    );
}

/// Continuously re-pair rule files so edits by either agent propagate.
pub async fn watch_rule_files(workspace: PathBuf) {
    loop {
        tokio::time::sleep(RULE_SYNC_INTERVAL).await;
        let root = workspace.clone();
        let result = tokio::task::spawn_blocking(move || sync_rule_files(&root)).await;
        if let Err(err) = result {
            warn!("Rule file sync failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_paths() -> (tempfile::TempDir, TetherPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = TetherPaths::new(dir.path().join("home"));
        (dir, paths)
    }

    #[test]
    fn init_seeds_template_and_dirs() {
        let (_dir, paths) = temp_paths();
        init_workspace(&paths).unwrap();
        assert!(paths.workspace().join("CLAUDE.md").is_file());
        assert!(paths.workspace().join("AGENTS.md").is_file());
        assert!(paths.mainmemory_path().is_file());
        assert!(paths.cron_tasks_dir().is_dir());
        assert!(paths.config_path().is_file());
        // The defaults loader input must not leak into the home tree.
        assert!(!paths.tether_home.join("config.defaults.json").exists());
    }

    #[test]
    fn zone_once_files_survive_reinit_zone_always_refresh() {
        let (_dir, paths) = temp_paths();
        init_workspace(&paths).unwrap();

        let memory = paths.mainmemory_path();
        fs::write(&memory, "user notes").unwrap();
        let rules = paths.workspace().join("CLAUDE.md");
        fs::write(&rules, "user-clobbered rules").unwrap();

        init_workspace(&paths).unwrap();
        // Zone-once: user content kept.
        assert_eq!(fs::read_to_string(&memory).unwrap(), "user notes");
        // Zone-always: framework content restored.
        assert_ne!(fs::read_to_string(&rules).unwrap(), "user-clobbered rules");
    }

    #[test]
    fn rule_pairing_copies_lone_file_and_prefers_newer() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("task-a");
        fs::create_dir_all(&task).unwrap();
        fs::write(task.join("CLAUDE.md"), "only claude").unwrap();

        sync_rule_files(dir.path());
        assert_eq!(
            fs::read_to_string(task.join("AGENTS.md")).unwrap(),
            "only claude"
        );

        // Make AGENTS.md strictly newer, resync: content flows back.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        fs::write(task.join("AGENTS.md"), "agents edited").unwrap();
        sync_rule_files(dir.path());
        assert_eq!(
            fs::read_to_string(task.join("CLAUDE.md")).unwrap(),
            "agents edited"
        );
    }

    #[test]
    fn legacy_tasks_dir_migrates_once() {
        let (_dir, paths) = temp_paths();
        fs::create_dir_all(paths.workspace().join("tasks").join("old-task")).unwrap();
        init_workspace(&paths).unwrap();
        assert!(paths.cron_tasks_dir().join("old-task").is_dir());
        assert!(!paths.workspace().join("tasks").exists());
    }

    #[test]
    fn runtime_injection_is_idempotent() {
        let (_dir, paths) = temp_paths();
        init_workspace(&paths).unwrap();
        inject_runtime_environment(&paths, None);
        let once = fs::read_to_string(paths.workspace().join("CLAUDE.md")).unwrap();
        inject_runtime_environment(&paths, None);
        let twice = fs::read_to_string(paths.workspace().join("CLAUDE.md")).unwrap();
        assert_eq!(once, twice);
        assert!(once.contains("## Runtime Environment"));
    }

    #[test]
    fn config_merge_adds_only_missing_top_level_keys() {
        let (_dir, paths) = temp_paths();
        fs::create_dir_all(paths.config_dir()).unwrap();
        fs::write(
            paths.config_path(),
            r#"{"model": "sonnet", "custom_key": 1}"#,
        )
        .unwrap();
        init_workspace(&paths).unwrap();
        let merged: Value =
            serde_json::from_str(&fs::read_to_string(paths.config_path()).unwrap()).unwrap();
        assert_eq!(merged["model"], "sonnet");
        assert_eq!(merged["custom_key"], 1);
        assert_eq!(merged["provider"], "claude");
    }
}
