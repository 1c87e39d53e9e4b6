//! JSONL parser for the codex CLI's `exec --json` output.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::events::StreamEvent;

/// Parse the full JSONL output of a non-streaming codex run into
/// `(result_text, thread_id, usage)`.
pub fn parse_codex_jsonl(raw: &str) -> (String, Option<String>, HashMap<String, Value>) {
    let mut result_parts: Vec<String> = Vec::new();
    let mut thread_id: Option<String> = None;
    let mut usage: HashMap<String, Value> = HashMap::new();

    for line in raw.lines() {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        let Some(data) = try_parse_object(stripped) else {
            continue;
        };

        if thread_id.is_none() {
            thread_id = extract_thread_id(&data);
        }
        if let Some(found) = extract_usage(&data) {
            usage = found;
        }
        if is_tool_item(&data) {
            // Tool chatter between messages resets the accumulated answer so
            // only the final assistant text survives.
            result_parts.clear();
        }
        extract_text(&data, &mut result_parts);
    }

    (result_parts.join("\n").trim().to_string(), thread_id, usage)
}

/// Parse one streamed JSONL line into normalized events.
pub fn parse_codex_stream_line(line: &str) -> Vec<StreamEvent> {
    let stripped = line.trim();
    if stripped.is_empty() {
        return Vec::new();
    }
    let Some(data) = try_parse_object(stripped) else {
        debug!("Codex: skipping unparseable JSONL line: {:.200}", stripped);
        return Vec::new();
    };

    let mut events = Vec::new();
    if let Some(thread_id) = extract_thread_id(&data) {
        events.push(StreamEvent::SystemInit {
            session_id: Some(thread_id),
        });
    }

    match data.get("type").and_then(Value::as_str) {
        Some("item.completed") => {
            if let Some(item) = data.get("item") {
                match item.get("type").and_then(Value::as_str) {
                    Some("agent_message") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                events.push(StreamEvent::TextDelta {
                                    text: text.to_string(),
                                });
                            }
                        }
                    }
                    Some("reasoning") => events.push(StreamEvent::Thinking),
                    Some(tool) if is_tool_item_type(tool) => {
                        let label = item
                            .get("command")
                            .and_then(Value::as_str)
                            .unwrap_or(tool);
                        events.push(StreamEvent::ToolUse {
                            tool_name: label.to_string(),
                        });
                    }
                    _ => {}
                }
            }
        }
        Some("item.started") => {
            if let Some(item) = data.get("item") {
                if let Some(tool) = item.get("type").and_then(Value::as_str) {
                    if is_tool_item_type(tool) {
                        let label = item
                            .get("command")
                            .and_then(Value::as_str)
                            .unwrap_or(tool);
                        events.push(StreamEvent::ToolUse {
                            tool_name: label.to_string(),
                        });
                    }
                }
            }
        }
        _ => {}
    }

    events
}

fn try_parse_object(line: &str) -> Option<Value> {
    let data: Value = serde_json::from_str(line).ok()?;
    data.is_object().then_some(data)
}

fn extract_thread_id(data: &Value) -> Option<String> {
    if data.get("type").and_then(Value::as_str) == Some("thread.started") {
        if let Some(tid) = data.get("thread_id").and_then(Value::as_str) {
            return Some(tid.trim().to_string());
        }
    }
    data.get("thread_id")
        .and_then(Value::as_str)
        .map(|tid| tid.trim().to_string())
}

fn extract_usage(data: &Value) -> Option<HashMap<String, Value>> {
    data.get("usage")
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

const TOOL_ITEM_TYPES: [&str; 5] = [
    "command_execution",
    "file_change",
    "web_search",
    "mcp_tool_call",
    "patch_apply",
];

fn is_tool_item_type(item_type: &str) -> bool {
    TOOL_ITEM_TYPES.contains(&item_type)
}

fn is_tool_item(data: &Value) -> bool {
    data.get("item")
        .and_then(|item| item.get("type"))
        .and_then(Value::as_str)
        .map(is_tool_item_type)
        .unwrap_or(false)
}

/// Only `item.completed` events contribute `agent_message` text to avoid
/// duplication across started/updated/completed.
fn extract_text(data: &Value, parts: &mut Vec<String>) {
    let event_type = data.get("type").and_then(Value::as_str).unwrap_or("");
    if event_type == "item.completed" {
        if let Some(item) = data.get("item") {
            if item.get("type").and_then(Value::as_str) == Some("agent_message") {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        parts.push(text.to_string());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_extracts_thread_text_and_usage() {
        let raw = r#"{"type":"thread.started","thread_id":"t-42"}
{"type":"item.started","item":{"type":"command_execution","command":"ls"}}
{"type":"item.completed","item":{"type":"command_execution","command":"ls"}}
{"type":"item.completed","item":{"type":"agent_message","text":"All done."}}
{"type":"turn.completed","usage":{"input_tokens":200,"output_tokens":12}}"#;
        let (text, thread_id, usage) = parse_codex_jsonl(raw);
        assert_eq!(text, "All done.");
        assert_eq!(thread_id.as_deref(), Some("t-42"));
        assert_eq!(usage["input_tokens"], 200);
    }

    #[test]
    fn tool_items_reset_earlier_text() {
        let raw = r#"{"type":"item.completed","item":{"type":"agent_message","text":"thinking out loud"}}
{"type":"item.completed","item":{"type":"command_execution","command":"make"}}
{"type":"item.completed","item":{"type":"agent_message","text":"final answer"}}"#;
        let (text, _, _) = parse_codex_jsonl(raw);
        assert_eq!(text, "final answer");
    }

    #[test]
    fn stream_line_yields_init_then_text() {
        let init = parse_codex_stream_line(r#"{"type":"thread.started","thread_id":"abc"}"#);
        assert!(matches!(
            &init[0],
            StreamEvent::SystemInit { session_id: Some(sid) } if sid == "abc"
        ));

        let text = parse_codex_stream_line(
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"hello"}}"#,
        );
        assert!(matches!(&text[0], StreamEvent::TextDelta { text } if text == "hello"));
    }

    #[test]
    fn garbage_lines_are_ignored() {
        assert!(parse_codex_stream_line("nonsense").is_empty());
        let (text, thread, _) = parse_codex_jsonl("nonsense\n[1,2,3]");
        assert!(text.is_empty());
        assert!(thread.is_none());
    }
}
