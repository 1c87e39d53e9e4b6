//! Shared types for the CLI layer.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable description of one CLI call.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub model_override: Option<String>,
    pub provider_override: Option<String>,
    pub chat_id: i64,
    pub process_label: String,
    pub resume_session: Option<String>,
    pub continue_session: bool,
    pub timeout: Option<Duration>,
}

/// Immutable result from a CLI call.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub result: String,
    pub returncode: Option<i32>,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub cost_usd: f64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub timed_out: bool,
    pub duration_ms: Option<f64>,
    pub stream_fallback: bool,
}

/// Raw per-provider response, before normalization to [`AgentResponse`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliResponse {
    pub session_id: Option<String>,
    pub result: String,
    pub is_error: bool,
    pub returncode: Option<i32>,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: Option<f64>,
    pub duration_api_ms: Option<f64>,
    pub num_turns: Option<u32>,
    pub total_cost_usd: Option<f64>,
    pub usage: HashMap<String, Value>,
}

impl CliResponse {
    pub fn input_tokens(&self) -> u64 {
        self.usage
            .get("input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn output_tokens(&self) -> u64 {
        self.usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Combined input + output tokens for context tracking.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens() + self.output_tokens()
    }
}

pub fn cli_to_agent_response(resp: CliResponse, stream_fallback: bool) -> AgentResponse {
    AgentResponse {
        total_tokens: resp.total_tokens(),
        input_tokens: resp.input_tokens(),
        result: resp.result,
        returncode: resp.returncode,
        session_id: resp.session_id,
        is_error: resp.is_error,
        cost_usd: resp.total_cost_usd.unwrap_or(0.0),
        timed_out: resp.timed_out,
        duration_ms: resp.duration_ms,
        stream_fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_totals_combine_input_and_output() {
        let mut usage = HashMap::new();
        usage.insert("input_tokens".to_string(), json!(120));
        usage.insert("output_tokens".to_string(), json!(30));
        let resp = CliResponse {
            usage,
            ..Default::default()
        };
        assert_eq!(resp.total_tokens(), 150);
    }

    #[test]
    fn missing_usage_counts_zero() {
        let resp = CliResponse::default();
        assert_eq!(resp.total_tokens(), 0);
    }
}
