//! Normalized stream events and the NDJSON parser for the claude CLI's
//! `--output-format stream-json` output.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

/// Events normalized across providers. Callers receive them in arrival
/// order; `Result` is always last when the stream completes cleanly.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ToolUse {
        tool_name: String,
    },
    Thinking,
    SystemInit {
        session_id: Option<String>,
    },
    SystemStatus {
        status: Option<String>,
    },
    CompactBoundary {
        trigger: String,
        pre_tokens: u64,
    },
    Result(ResultEvent),
}

/// Final event with usage, cost, and session id.
#[derive(Debug, Clone, Default)]
pub struct ResultEvent {
    pub session_id: Option<String>,
    pub result: String,
    pub is_error: bool,
    pub returncode: Option<i32>,
    pub duration_ms: Option<f64>,
    pub duration_api_ms: Option<f64>,
    pub total_cost_usd: Option<f64>,
    pub usage: HashMap<String, Value>,
    pub num_turns: Option<u32>,
}

/// Parse one NDJSON line into zero or more normalized events.
/// Malformed lines are skipped; the stream must survive garbage.
pub fn parse_stream_line(line: &str) -> Vec<StreamEvent> {
    let stripped = line.trim();
    if stripped.is_empty() {
        return Vec::new();
    }

    let data: Value = match serde_json::from_str(stripped) {
        Ok(value) => value,
        Err(_) => {
            debug!("Unparseable stream line: {:.200}", stripped);
            return Vec::new();
        }
    };

    match data.get("type").and_then(Value::as_str) {
        Some("result") => vec![StreamEvent::Result(parse_result(&data))],
        Some("assistant") => parse_assistant_content(&data),
        Some("system") => parse_system_event(&data),
        _ => Vec::new(),
    }
}

fn parse_result(data: &Value) -> ResultEvent {
    let usage = data
        .get("usage")
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    ResultEvent {
        session_id: data
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        result: data
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        is_error: data.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        returncode: None,
        duration_ms: data.get("duration_ms").and_then(Value::as_f64),
        duration_api_ms: data.get("duration_api_ms").and_then(Value::as_f64),
        total_cost_usd: data.get("total_cost_usd").and_then(Value::as_f64),
        usage,
        num_turns: data
            .get("num_turns")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
    }
}

fn parse_system_event(data: &Value) -> Vec<StreamEvent> {
    match data.get("subtype").and_then(Value::as_str) {
        Some("init") => vec![StreamEvent::SystemInit {
            session_id: data
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        }],
        Some("status") => vec![StreamEvent::SystemStatus {
            status: data
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
        }],
        Some("compact_boundary") => {
            let meta = data.get("compact_metadata");
            vec![StreamEvent::CompactBoundary {
                trigger: meta
                    .and_then(|m| m.get("trigger"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                pre_tokens: meta
                    .and_then(|m| m.get("pre_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            }]
        }
        _ => Vec::new(),
    }
}

/// Extract all content blocks from an assistant message.
fn parse_assistant_content(data: &Value) -> Vec<StreamEvent> {
    let Some(content) = data
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(StreamEvent::TextDelta {
                            text: text.to_string(),
                        });
                    }
                }
            }
            Some("tool_use") => {
                if let Some(name) = block.get("name").and_then(Value::as_str) {
                    if !name.is_empty() {
                        events.push(StreamEvent::ToolUse {
                            tool_name: name.to_string(),
                        });
                    }
                }
            }
            Some("thinking") => events.push(StreamEvent::Thinking),
            _ => {}
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_event() {
        let line = r#"{"type":"result","session_id":"abc","result":"done","is_error":false,"total_cost_usd":0.12,"usage":{"input_tokens":10,"output_tokens":5},"num_turns":3}"#;
        let events = parse_stream_line(line);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Result(result) => {
                assert_eq!(result.session_id.as_deref(), Some("abc"));
                assert_eq!(result.result, "done");
                assert_eq!(result.total_cost_usd, Some(0.12));
                assert_eq!(result.num_turns, Some(3));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn parses_assistant_blocks_in_order() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","name":"Bash"},{"type":"thinking","text":"..."}]}}"#;
        let events = parse_stream_line(line);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "hi"));
        assert!(matches!(&events[1], StreamEvent::ToolUse { tool_name } if tool_name == "Bash"));
        assert!(matches!(&events[2], StreamEvent::Thinking));
    }

    #[test]
    fn parses_system_init_and_compact_boundary() {
        let init = parse_stream_line(r#"{"type":"system","subtype":"init","session_id":"s1"}"#);
        assert!(matches!(
            &init[0],
            StreamEvent::SystemInit { session_id: Some(sid) } if sid == "s1"
        ));

        let compact = parse_stream_line(
            r#"{"type":"system","subtype":"compact_boundary","compact_metadata":{"trigger":"auto","pre_tokens":9000}}"#,
        );
        assert!(matches!(
            &compact[0],
            StreamEvent::CompactBoundary { trigger, pre_tokens: 9000 } if trigger == "auto"
        ));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_stream_line("{broken json").is_empty());
        assert!(parse_stream_line("").is_empty());
        assert!(parse_stream_line(r#"{"type":"unknown"}"#).is_empty());
    }
}
