//! Safe workspace file reads with fallback defaults.

use std::path::Path;

use tracing::warn;

use crate::core::paths::TetherPaths;

/// Read a file, returning None when it does not exist or cannot be read.
pub fn read_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!("Failed to read file {}: {err}", path.display());
            None
        }
    }
}

/// Read MAINMEMORY.md, returning an empty string when missing.
pub fn read_mainmemory(paths: &TetherPaths) -> String {
    read_file(&paths.mainmemory_path()).unwrap_or_default()
}
