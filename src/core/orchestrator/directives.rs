//! Inline directive parser: leading `@model` and `@key=value` tokens.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

/// Result of parsing inline directives from a message.
#[derive(Debug, Clone, Default)]
pub struct ParsedDirectives {
    pub cleaned: String,
    pub model: Option<String>,
    pub raw_directives: HashMap<String, Option<String>>,
}

impl ParsedDirectives {
    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_directive_only(&self) -> bool {
        self.cleaned.is_empty()
    }
}

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([a-zA-Z][a-zA-Z0-9_-]*)(?:=(\S+))?").expect("static regex"))
}

/// Parse leading `@directives`. Only tokens at the very start of the
/// message are consumed, so "email @opus" stays untouched.
pub fn parse_directives(text: &str, known_models: &[String]) -> ParsedDirectives {
    let stripped = text.trim();
    if !stripped.starts_with('@') {
        return ParsedDirectives {
            cleaned: stripped.to_string(),
            ..Default::default()
        };
    }

    let mut model: Option<String> = None;
    let mut raw_directives = HashMap::new();
    let mut pos = 0;

    for caps in directive_regex().captures_iter(stripped) {
        let whole = caps.get(0).expect("group 0");
        let prefix = &stripped[pos..whole.start()];
        if !prefix.trim().is_empty() {
            break;
        }

        let key = caps[1].to_lowercase();
        let value = caps.get(2).map(|m| m.as_str().to_string());

        if model.is_none() && known_models.iter().any(|m| m == &key) {
            model = Some(key);
        } else {
            raw_directives.insert(key, value);
        }
        pos = whole.end();
    }

    if model.is_none() && raw_directives.is_empty() {
        return ParsedDirectives {
            cleaned: stripped.to_string(),
            ..Default::default()
        };
    }

    let cleaned = stripped[pos..].trim().to_string();
    debug!("Directive parsed model={:?} cleaned={}", model, !cleaned.is_empty());
    ParsedDirectives {
        cleaned,
        model,
        raw_directives,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models() -> Vec<String> {
        vec!["haiku".into(), "sonnet".into(), "opus".into()]
    }

    #[test]
    fn leading_model_directive_consumed() {
        let parsed = parse_directives("@opus explain this", &models());
        assert_eq!(parsed.model.as_deref(), Some("opus"));
        assert_eq!(parsed.cleaned, "explain this");
    }

    #[test]
    fn mid_message_mention_is_not_a_directive() {
        let parsed = parse_directives("email @opus about the launch", &models());
        assert!(parsed.model.is_none());
        assert_eq!(parsed.cleaned, "email @opus about the launch");
    }

    #[test]
    fn unknown_keys_collected_and_ignored() {
        let parsed = parse_directives("@verbose=2 @opus hi", &models());
        assert_eq!(parsed.model.as_deref(), Some("opus"));
        assert_eq!(
            parsed.raw_directives.get("verbose"),
            Some(&Some("2".to_string()))
        );
        assert_eq!(parsed.cleaned, "hi");
    }

    #[test]
    fn directive_only_message_detected() {
        let parsed = parse_directives("@sonnet", &models());
        assert!(parsed.has_model());
        assert!(parsed.is_directive_only());
    }

    #[test]
    fn plain_text_passes_through() {
        let parsed = parse_directives("  hello world  ", &models());
        assert!(parsed.model.is_none());
        assert_eq!(parsed.cleaned, "hello world");
    }
}
