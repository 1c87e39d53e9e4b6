//! Webhook entry definitions, JSON persistence, and template rendering.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::core::jsonfs;
use crate::errors::{CoreError, CoreResult};

fn default_auth_mode() -> String {
    "bearer".into()
}
fn default_hmac_algorithm() -> String {
    "sha256".into()
}
fn default_hmac_encoding() -> String {
    "hex".into()
}
fn default_sig_prefix() -> String {
    "sha256=".into()
}

/// A registered webhook endpoint definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    /// "wake" resumes the main chat session; "task" spawns an isolated
    /// subprocess in a task folder.
    pub mode: String,
    pub prompt_template: String,
    pub enabled: bool,
    pub task_folder: Option<String>,

    #[serde(default = "default_auth_mode")]
    pub auth_mode: String,
    /// Per-hook bearer token (auto-generated on creation by the helper
    /// tools). Never surfaced in chat-visible output.
    pub token: String,
    pub hmac_secret: String,
    /// Header carrying the signature (e.g. "X-Hub-Signature-256").
    pub hmac_header: String,
    #[serde(default = "default_hmac_algorithm")]
    pub hmac_algorithm: String,
    #[serde(default = "default_hmac_encoding")]
    pub hmac_encoding: String,
    /// Prefix to strip from the header value; ignored when a regex is set.
    #[serde(default = "default_sig_prefix")]
    pub hmac_sig_prefix: String,
    /// Regex extracting the signature (group 1); overrides the prefix.
    pub hmac_sig_regex: String,
    /// Regex on the header value; group 1 is prepended to the body with a
    /// "." separator before HMAC computation (Stripe/Slack style).
    pub hmac_payload_prefix_regex: String,

    pub created_at: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    // Per-hook execution overrides.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub cli_parameters: Vec<String>,

    // Quiet hours and dependency (task mode only).
    pub quiet_start: Option<u8>,
    pub quiet_end: Option<u8>,
    pub dependency: Option<String>,
}

impl Default for WebhookEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            mode: "wake".into(),
            prompt_template: String::new(),
            enabled: true,
            task_folder: None,
            auth_mode: default_auth_mode(),
            token: String::new(),
            hmac_secret: String::new(),
            hmac_header: String::new(),
            hmac_algorithm: default_hmac_algorithm(),
            hmac_encoding: default_hmac_encoding(),
            hmac_sig_prefix: default_sig_prefix(),
            hmac_sig_regex: String::new(),
            hmac_payload_prefix_regex: String::new(),
            created_at: None,
            trigger_count: 0,
            last_triggered_at: None,
            last_error: None,
            provider: None,
            model: None,
            reasoning_effort: None,
            cli_parameters: Vec::new(),
            quiet_start: None,
            quiet_end: None,
            dependency: None,
        }
    }
}

/// Immutable result of one webhook dispatch.
#[derive(Debug, Clone)]
pub struct WebhookResult {
    pub hook_id: String,
    pub hook_title: String,
    pub mode: String,
    pub result_text: String,
    pub status: String,
}

/// Replace `{{field}}` placeholders with payload values. Missing keys
/// render as `{{?field}}` so they stay visible but non-fatal.
pub fn render_template(template: &str, payload: &serde_json::Map<String, Value>) -> String {
    let re = Regex::new(r"\{\{(\w+)\}\}").expect("static template regex");
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match payload.get(key) {
            None | Some(Value::Null) => format!("{{{{?{key}}}}}"),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    })
    .into_owned()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HooksFile {
    hooks: Vec<WebhookEntry>,
}

/// JSON-backed webhook store. Data only; the observer owns dispatch.
pub struct WebhookStore {
    path: PathBuf,
    hooks: Mutex<Vec<WebhookEntry>>,
}

impl WebhookStore {
    pub fn new(path: PathBuf) -> Self {
        let hooks = Self::load_from(&path);
        Self {
            path,
            hooks: Mutex::new(hooks),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn add_hook(&self, mut hook: WebhookEntry) -> CoreResult<()> {
        if hook.created_at.is_none() {
            hook.created_at = Some(Utc::now());
        }
        let mut hooks = self.hooks.lock().expect("webhook store lock");
        if hooks.iter().any(|h| h.id == hook.id) {
            return Err(CoreError::Webhook(format!("hook '{}' already exists", hook.id)));
        }
        info!("Webhook added: {} (mode={})", hook.id, hook.mode);
        hooks.push(hook);
        self.save(&hooks)
    }

    pub fn remove_hook(&self, hook_id: &str) -> CoreResult<bool> {
        let mut hooks = self.hooks.lock().expect("webhook store lock");
        let before = hooks.len();
        hooks.retain(|h| h.id != hook_id);
        if hooks.len() == before {
            return Ok(false);
        }
        self.save(&hooks)?;
        info!("Webhook removed: {hook_id}");
        Ok(true)
    }

    pub fn list_hooks(&self) -> Vec<WebhookEntry> {
        self.hooks.lock().expect("webhook store lock").clone()
    }

    pub fn get_hook(&self, hook_id: &str) -> Option<WebhookEntry> {
        self.hooks
            .lock()
            .expect("webhook store lock")
            .iter()
            .find(|h| h.id == hook_id)
            .cloned()
    }

    /// Bump the trigger counter, stamp last_triggered_at, record the error
    /// status (None on success).
    pub fn record_trigger(&self, hook_id: &str, error: Option<&str>) -> CoreResult<()> {
        let mut hooks = self.hooks.lock().expect("webhook store lock");
        let Some(hook) = hooks.iter_mut().find(|h| h.id == hook_id) else {
            return Ok(());
        };
        hook.trigger_count += 1;
        hook.last_triggered_at = Some(Utc::now());
        hook.last_error = error.map(str::to_string);
        self.save(&hooks)
    }

    pub fn reload(&self) {
        let fresh = Self::load_from(&self.path);
        *self.hooks.lock().expect("webhook store lock") = fresh;
    }

    fn load_from(path: &PathBuf) -> Vec<WebhookEntry> {
        match jsonfs::read_json::<HooksFile>(path) {
            Ok(Some(file)) => file.hooks,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("Corrupt webhooks file {}: {err}", path.display());
                Vec::new()
            }
        }
    }

    fn save(&self, hooks: &[WebhookEntry]) -> CoreResult<()> {
        let file = HooksFile { hooks: hooks.to_vec() };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| CoreError::Webhook(format!("serialize hooks: {e}")))?;
        jsonfs::atomic_write(&self.path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_renders_present_and_missing_fields() {
        let payload = json!({"subject": "Hi", "sender": "a@b"});
        let rendered = render_template(
            "Email {{subject}} from {{from}}",
            payload.as_object().unwrap(),
        );
        assert_eq!(rendered, "Email Hi from {{?from}}");
    }

    #[test]
    fn template_stringifies_non_string_values() {
        let payload = json!({"count": 3, "ok": true});
        let rendered = render_template("{{count}} items, ok={{ok}}", payload.as_object().unwrap());
        assert_eq!(rendered, "3 items, ok=true");
    }

    #[test]
    fn trigger_bookkeeping_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = WebhookStore::new(dir.path().join("webhooks.json"));
        store
            .add_hook(WebhookEntry {
                id: "gh".into(),
                title: "GitHub".into(),
                mode: "task".into(),
                prompt_template: "x".into(),
                task_folder: Some("gh".into()),
                ..Default::default()
            })
            .unwrap();

        store.record_trigger("gh", None).unwrap();
        store.record_trigger("gh", Some("error:timeout")).unwrap();

        let reopened = WebhookStore::new(dir.path().join("webhooks.json"));
        let hook = reopened.get_hook("gh").unwrap();
        assert_eq!(hook.trigger_count, 2);
        assert_eq!(hook.last_error.as_deref(), Some("error:timeout"));
    }
}
