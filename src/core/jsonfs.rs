//! Atomic file persistence helpers shared by the JSON stores.

use std::path::{Path, PathBuf};

use crate::errors::{CoreError, CoreResult};

/// Write `content` to `path` atomically: temp file in the same directory,
/// then rename over the target. A crash leaves either the old file intact
/// or the new file fully written.
pub fn atomic_write(path: &Path, content: &str) -> CoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CoreError::Infra(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let tmp: PathBuf = path.with_extension("tmp");
    if let Err(err) = std::fs::write(&tmp, content) {
        let _ = std::fs::remove_file(&tmp);
        return Err(CoreError::Infra(format!("write {}: {err}", tmp.display())));
    }
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(CoreError::Infra(format!("rename {}: {err}", path.display())));
    }
    Ok(())
}

/// Async wrapper around [`atomic_write`] so callers never block the runtime.
pub async fn atomic_write_async(path: PathBuf, content: String) -> CoreResult<()> {
    tokio::task::spawn_blocking(move || atomic_write(&path, &content))
        .await
        .map_err(|e| CoreError::Infra(format!("write task join: {e}")))?
}

/// Read and parse a JSON file, returning `None` when the file is missing.
/// Corrupt content is reported as an error for the caller to decide on.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(CoreError::Infra(format!("read {}: {err}", path.display()))),
    };
    let value = serde_json::from_str(&raw)
        .map_err(|e| CoreError::Session(format!("parse {}: {e}", path.display())))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        atomic_write(&path, &json!({"a": 1}).to_string()).unwrap();
        let loaded: Option<serde_json::Value> = read_json(&path).unwrap();
        assert_eq!(loaded.unwrap()["a"], 1);
    }

    #[test]
    fn atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        atomic_write(&path, "{\"v\":1}").unwrap();
        atomic_write(&path, "{\"v\":2}").unwrap();
        let loaded: Option<serde_json::Value> = read_json(&path).unwrap();
        assert_eq!(loaded.unwrap()["v"], 2);
        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn read_json_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<serde_json::Value> =
            read_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }
}
