//! Three-way skill directory sync between the workspace and the agent
//! CLI homes, so a skill installed anywhere is visible everywhere.
//!
//! Safety guarantees:
//! - Real directories are never overwritten or removed.
//! - Valid symlinks pointing outside the sync set are left alone.
//! - Broken symlinks are cleaned up.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::paths::{claude_skills_dir, codex_skills_dir, TetherPaths};
use crate::platform::{NativePlatform, Platform};

const SKILL_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Scan one skills directory: immediate subdirectories keyed by name.
/// Dot-prefixed names and broken symlinks are skipped; valid symlinks are
/// included.
fn discover_skills(base: &Path) -> BTreeMap<String, PathBuf> {
    let mut skills = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(base) else {
        return skills;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_symlink() {
            if path.exists() {
                skills.insert(name, path);
            }
            continue;
        }
        if path.is_dir() {
            skills.insert(name, path);
        }
    }
    skills
}

/// Sync directories in priority order: workspace first, then the agent
/// homes that exist on this host.
fn sync_dirs(paths: &TetherPaths) -> Vec<PathBuf> {
    let mut dirs = vec![paths.skills_dir()];
    if let Some(claude) = claude_skills_dir() {
        dirs.push(claude);
    }
    if let Some(codex) = codex_skills_dir() {
        dirs.push(codex);
    }
    dirs
}

/// Canonical source for a skill: the first real (non-symlink) directory in
/// priority order; if every entry is a link, the first valid link's target.
fn resolve_canonical(name: &str, registries: &[BTreeMap<String, PathBuf>]) -> Option<PathBuf> {
    for registry in registries {
        if let Some(path) = registry.get(name) {
            if !path.is_symlink() {
                return Some(path.clone());
            }
        }
    }
    for registry in registries {
        if let Some(path) = registry.get(name) {
            if path.is_symlink() && path.exists() {
                return path.canonicalize().ok();
            }
        }
    }
    None
}

/// Idempotently ensure `link` points at `target`. Never touches real
/// directories; never retargets a link that resolves outside `sync_set`.
fn ensure_link(link: &Path, target: &Path, sync_set: &[PathBuf]) -> bool {
    if link.exists() && !link.is_symlink() {
        return false;
    }
    if link.is_symlink() {
        let resolved = link.canonicalize().ok();
        if resolved.as_deref() == target.canonicalize().ok().as_deref() {
            return false;
        }
        let inside_sync_set = resolved
            .as_deref()
            .map(|r| sync_set.iter().any(|base| r.starts_with(base)))
            .unwrap_or(true);
        if !inside_sync_set {
            // User-managed external link; leave it alone.
            return false;
        }
        if std::fs::remove_file(link).is_err() {
            return false;
        }
    }
    match NativePlatform::create_dir_link(link, target) {
        Ok(()) => true,
        Err(err) => {
            warn!("Failed to link skill {} -> {}: {err}", link.display(), target.display());
            false
        }
    }
}

fn clean_broken_links(directory: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_symlink() && !path.exists() && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// One full sync pass over the three skill directories.
pub fn sync_skills(paths: &TetherPaths) {
    sync_skill_dirs(&sync_dirs(paths));
}

/// Sync an explicit set of skill directories, first entry highest
/// priority.
pub fn sync_skill_dirs(dirs: &[PathBuf]) {
    let registries: Vec<BTreeMap<String, PathBuf>> =
        dirs.iter().map(|d| discover_skills(d)).collect();

    let mut names: BTreeSet<String> = BTreeSet::new();
    for registry in &registries {
        names.extend(registry.keys().cloned());
    }

    for name in &names {
        let Some(canonical) = resolve_canonical(name, &registries) else {
            continue;
        };
        for base in dirs {
            if !base.is_dir() {
                if std::fs::create_dir_all(base).is_err() {
                    continue;
                }
            }
            let link = base.join(name);
            if link == canonical {
                continue;
            }
            if ensure_link(&link, &canonical, dirs) {
                info!("Skill link created: {} -> {}", link.display(), canonical.display());
            }
        }
    }

    for base in dirs {
        let removed = clean_broken_links(base);
        if removed > 0 {
            info!("Cleaned {removed} broken skill link(s) in {}", base.display());
        }
    }
}

/// Periodic sync task.
pub async fn watch_skill_sync(paths: TetherPaths) {
    loop {
        tokio::time::sleep(SKILL_SYNC_INTERVAL).await;
        let paths = paths.clone();
        let result = tokio::task::spawn_blocking(move || sync_skills(&paths)).await;
        if let Err(err) = result {
            warn!("Skill sync failed: {err}");
        }
    }
}

/// Shutdown cleanup: in the agent-home skill directories, unlink only
/// those symlinks whose targets resolve inside the workspace skills dir.
/// Real directories and external user links stay.
pub fn shutdown_cleanup(paths: &TetherPaths) {
    let Ok(workspace_skills) = paths.skills_dir().canonicalize() else {
        return;
    };
    let agent_dirs: Vec<PathBuf> = [claude_skills_dir(), codex_skills_dir()]
        .into_iter()
        .flatten()
        .collect();
    for dir in agent_dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_symlink() {
                continue;
            }
            let points_into_workspace = path
                .canonicalize()
                .map(|resolved| resolved.starts_with(&workspace_skills))
                .unwrap_or(false);
            if points_into_workspace {
                debug!("Removing workspace skill link: {}", path.display());
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn link_dir(link: &Path, target: &Path) {
        NativePlatform::create_dir_link(link, target).unwrap();
    }

    #[test]
    fn discover_skips_dot_names_and_broken_links() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("alpha")).unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        link_dir(&dir.path().join("dangling"), &dir.path().join("gone"));

        let skills = discover_skills(dir.path());
        assert!(skills.contains_key("alpha"));
        assert!(!skills.contains_key(".hidden"));
        assert!(!skills.contains_key("dangling"));
    }

    #[test]
    fn canonical_prefers_first_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real-home");
        fs::create_dir_all(real.join("s")).unwrap();
        let linked = dir.path().join("link-home");
        fs::create_dir_all(&linked).unwrap();
        link_dir(&linked.join("s"), &real.join("s"));

        let registries = vec![
            discover_skills(&linked),
            discover_skills(&real),
        ];
        // The link-home entry is a symlink; the real dir in the second
        // registry wins.
        let canonical = resolve_canonical("s", &registries).unwrap();
        assert_eq!(canonical, real.join("s"));
    }

    #[test]
    fn ensure_link_never_replaces_real_dirs_or_external_links() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let sync_set = vec![dir.path().join("synced")];
        fs::create_dir_all(&sync_set[0]).unwrap();

        // Real directory: untouched.
        let real = dir.path().join("real");
        fs::create_dir_all(&real).unwrap();
        assert!(!ensure_link(&real, &target, &sync_set));
        assert!(!real.is_symlink());

        // External link: untouched.
        let external_target = dir.path().join("external");
        fs::create_dir_all(&external_target).unwrap();
        let external_link = dir.path().join("ext-link");
        link_dir(&external_link, &external_target);
        assert!(!ensure_link(&external_link, &target, &sync_set));
        assert_eq!(external_link.canonicalize().unwrap(), external_target.canonicalize().unwrap());
    }

    fn snapshot(p: &Path) -> Vec<(String, bool)> {
        let mut entries: Vec<(String, bool)> = fs::read_dir(p)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| {
                        (
                            e.file_name().to_string_lossy().to_string(),
                            e.path().is_symlink(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();
        entries
    }

    #[test]
    fn missing_skills_get_linked_from_priority_source() {
        let root = tempfile::tempdir().unwrap();
        let workspace = root.path().join("workspace-skills");
        let claude = root.path().join("claude-skills");
        let codex = root.path().join("codex-skills");
        for dir in [&workspace, &claude, &codex] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::create_dir_all(workspace.join("s")).unwrap();
        // Agent C already carries a link for `s`.
        link_dir(&claude.join("s"), &workspace.join("s"));

        let dirs = vec![workspace.clone(), claude.clone(), codex.clone()];
        sync_skill_dirs(&dirs);

        // Workspace untouched (real dir), claude untouched (already
        // linked), codex gains a link to the workspace source.
        assert!(!workspace.join("s").is_symlink());
        assert!(claude.join("s").is_symlink());
        assert!(codex.join("s").is_symlink());
        assert_eq!(
            codex.join("s").canonicalize().unwrap(),
            workspace.join("s").canonicalize().unwrap()
        );

        // Removing the source: the next pass cleans the now-broken links.
        fs::remove_dir_all(workspace.join("s")).unwrap();
        sync_skill_dirs(&dirs);
        assert!(!codex.join("s").exists());
        assert!(!claude.join("s").exists());
    }

    #[test]
    fn sync_pass_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let workspace = root.path().join("workspace-skills");
        let claude = root.path().join("claude-skills");
        fs::create_dir_all(workspace.join("notes")).unwrap();
        fs::create_dir_all(&claude).unwrap();
        let dirs = vec![workspace.clone(), claude.clone()];

        sync_skill_dirs(&dirs);
        let first = (snapshot(&workspace), snapshot(&claude));
        sync_skill_dirs(&dirs);
        let second = (snapshot(&workspace), snapshot(&claude));
        assert_eq!(first, second);
        assert!(claude.join("notes").is_symlink());
    }
}
