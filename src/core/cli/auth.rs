//! Provider authentication discovery via well-known credential files.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Authenticated,
    Installed,
    NotFound,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Authenticated => "authenticated",
            AuthStatus::Installed => "installed",
            AuthStatus::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthResult {
    pub provider: &'static str,
    pub status: AuthStatus,
    pub auth_file: Option<PathBuf>,
    pub auth_age: Option<DateTime<Utc>>,
}

impl AuthResult {
    pub fn is_authenticated(&self) -> bool {
        self.status == AuthStatus::Authenticated
    }
}

fn file_mtime(path: &PathBuf) -> Option<DateTime<Utc>> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Claude auth lives at `~/.claude/.credentials.json`.
pub fn check_claude_auth() -> AuthResult {
    let result = match paths::claude_home_dir() {
        Some(home) => {
            let credentials = home.join(".credentials.json");
            if credentials.is_file() {
                let age = file_mtime(&credentials);
                AuthResult {
                    provider: "claude",
                    status: AuthStatus::Authenticated,
                    auth_file: Some(credentials),
                    auth_age: age,
                }
            } else if home.is_dir() {
                AuthResult {
                    provider: "claude",
                    status: AuthStatus::Installed,
                    auth_file: None,
                    auth_age: None,
                }
            } else {
                not_found("claude")
            }
        }
        None => not_found("claude"),
    };
    debug!("Auth check provider={} status={}", result.provider, result.status.as_str());
    result
}

/// Codex auth lives at `$CODEX_HOME/auth.json` (default `~/.codex`).
pub fn check_codex_auth() -> AuthResult {
    let result = match paths::codex_home_dir() {
        Some(home) => {
            let auth_file = home.join("auth.json");
            if auth_file.is_file() {
                let age = file_mtime(&auth_file);
                AuthResult {
                    provider: "codex",
                    status: AuthStatus::Authenticated,
                    auth_file: Some(auth_file),
                    auth_age: age,
                }
            } else if home.is_dir() {
                AuthResult {
                    provider: "codex",
                    status: AuthStatus::Installed,
                    auth_file: None,
                    auth_age: None,
                }
            } else {
                not_found("codex")
            }
        }
        None => not_found("codex"),
    };
    debug!("Auth check provider={} status={}", result.provider, result.status.as_str());
    result
}

fn not_found(provider: &'static str) -> AuthResult {
    AuthResult {
        provider,
        status: AuthStatus::NotFound,
        auth_file: None,
        auth_age: None,
    }
}

/// Check auth for all known providers.
pub fn check_all_auth() -> Vec<AuthResult> {
    vec![check_claude_auth(), check_codex_auth()]
}

/// Names of providers that passed the auth check.
pub fn authenticated_providers() -> Vec<String> {
    check_all_auth()
        .into_iter()
        .filter(AuthResult::is_authenticated)
        .map(|result| result.provider.to_string())
        .collect()
}
