//! Message hooks: prompt suffixes injected based on session state.

use tracing::{debug, info};

/// Immutable snapshot of session state passed to hook conditions.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub chat_id: i64,
    pub message_count: u64,
    pub is_new_session: bool,
    pub provider: String,
    pub model: String,
}

/// A named hook that appends text to the prompt when its condition holds.
pub struct MessageHook {
    pub name: &'static str,
    pub condition: fn(&HookContext) -> bool,
    pub suffix: &'static str,
}

#[derive(Default)]
pub struct MessageHookRegistry {
    hooks: Vec<MessageHook>,
}

impl MessageHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: MessageHook) {
        debug!("Hook registered: {}", hook.name);
        self.hooks.push(hook);
    }

    /// Evaluate all hooks and append matching suffixes to the prompt.
    pub fn apply(&self, prompt: &str, ctx: &HookContext) -> String {
        let mut suffixes = Vec::new();
        for hook in &self.hooks {
            if (hook.condition)(ctx) {
                info!("Hook fired: {} msgs={}", hook.name, ctx.message_count);
                suffixes.push(hook.suffix);
            }
        }
        if suffixes.is_empty() {
            return prompt.to_string();
        }
        format!("{prompt}\n\n{}", suffixes.join("\n\n"))
    }
}

/// Fires on every 6th, 12th, 18th... message, never on the first.
/// `message_count` is pre-increment: count 5 means the 6th outgoing
/// message is being built.
fn every_sixth_message(ctx: &HookContext) -> bool {
    let effective = ctx.message_count + 1;
    effective >= 6 && effective % 6 == 0
}

pub const MAINMEMORY_REMINDER: MessageHook = MessageHook {
    name: "mainmemory_reminder",
    condition: every_sixth_message,
    suffix: "## MEMORY CHECK\n\
Silently review: memory_system/MAINMEMORY.md, user_tools/, cron_tasks/.\n\
Compare what you already know with this conversation so far.\n\
If something important is missing from memory (personality, preferences, \
decisions, facts) -- update MAINMEMORY.md silently.\n\
If you notice a gap that only the user can fill, ask ONE natural follow-up \
question that fits the current conversation. Do not interrogate.",
};

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(message_count: u64) -> HookContext {
        HookContext {
            chat_id: 1,
            message_count,
            is_new_session: false,
            provider: "claude".into(),
            model: "opus".into(),
        }
    }

    #[test]
    fn reminder_fires_every_sixth_message() {
        let mut registry = MessageHookRegistry::new();
        registry.register(MAINMEMORY_REMINDER);

        // counts 0..4 -> messages 1..5: no hook.
        for count in 0..5 {
            assert_eq!(registry.apply("p", &ctx(count)), "p", "count {count}");
        }
        // count 5 -> 6th message: hook fires.
        assert!(registry.apply("p", &ctx(5)).contains("MEMORY CHECK"));
        // count 11 -> 12th message: fires again.
        assert!(registry.apply("p", &ctx(11)).contains("MEMORY CHECK"));
        // count 6 -> 7th: quiet.
        assert_eq!(registry.apply("p", &ctx(6)), "p");
    }

    #[test]
    fn empty_registry_is_identity() {
        let registry = MessageHookRegistry::new();
        assert_eq!(registry.apply("prompt", &ctx(5)), "prompt");
    }
}
