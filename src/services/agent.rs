//! Thin JSON client for the external search agent service.
//!
//! The agent is a black box: the engine sends the task context, the agent
//! answers with a strict envelope. Everything outside that envelope contract
//! is the agent's business.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AgentConfig;
use crate::error::AppResult;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent call timed out after {0}s")]
    Timeout(u64),

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("agent returned an invalid envelope: {0}")]
    Rejected(String),
}

impl AgentError {
    /// Stable classification recorded on failed executions.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Timeout(_) => "agent_timeout",
            AgentError::Transport(_) => "agent_transport",
            AgentError::Rejected(_) => "agent_rejected",
        }
    }
}

/// Context sent to the agent for one firing.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub task_id: String,
    pub user_id: String,
    pub search_query: String,
    pub condition_description: String,
    /// The evidence blob from the previous run, passed back verbatim.
    pub previous_evidence: Option<String>,
    /// ISO-8601 UTC timestamp of the previous execution, if any.
    pub last_execution_at: Option<String>,
}

/// The validated response envelope.
///
/// `notification` being non-null is the authoritative condition-met signal;
/// `confidence` is advisory metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEnvelope {
    pub evidence: String,
    pub sources: Vec<String>,
    pub confidence: i64,
    pub next_run: Option<DateTime<Utc>>,
    pub notification: Option<String>,
}

#[derive(Clone)]
pub struct AgentClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    default_timeout: Duration,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient").field("url", &self.url).finish_non_exhaustive()
    }
}

impl AgentClient {
    pub fn new(config: &AgentConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            default_timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// POST the request and validate the response envelope.
    pub async fn invoke(
        &self,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Result<AgentEnvelope, AgentError> {
        let mut builder = self.client.post(&self.url).timeout(timeout).json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(timeout.as_secs())
            } else {
                AgentError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Transport(format!(
                "agent service returned {status}: {body}"
            )));
        }

        let raw: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(timeout.as_secs())
            } else {
                AgentError::Rejected(format!("body is not JSON: {e}"))
            }
        })?;

        validate_envelope(&raw)
    }
}

/// Strict envelope validation. Collects every offending field so the
/// execution log names all of them at once.
fn validate_envelope(raw: &Value) -> Result<AgentEnvelope, AgentError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| AgentError::Rejected("envelope is not a JSON object".to_string()))?;

    let mut problems: Vec<String> = Vec::new();

    let evidence = match obj.get("evidence").and_then(Value::as_str) {
        Some(s) => s.to_string(),
        None => {
            problems.push("evidence: expected string".to_string());
            String::new()
        }
    };

    let sources = match obj.get("sources").and_then(Value::as_array) {
        Some(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => problems.push(format!("sources[{i}]: expected string")),
                }
            }
            out
        }
        None => {
            problems.push("sources: expected array of strings".to_string());
            Vec::new()
        }
    };

    let confidence = match obj.get("confidence").and_then(Value::as_i64) {
        Some(v) if (0..=100).contains(&v) => v,
        Some(v) => {
            problems.push(format!("confidence: {v} outside 0..=100"));
            0
        }
        None => {
            problems.push("confidence: expected integer".to_string());
            0
        }
    };

    let next_run = match obj.get("next_run") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                problems.push(format!("next_run: not ISO-8601 ({e})"));
                None
            }
        },
        Some(other) => {
            problems.push(format!("next_run: expected string or null, got {other}"));
            None
        }
    };

    let notification = match obj.get("notification") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            problems.push(format!("notification: expected string or null, got {other}"));
            None
        }
    };

    if !problems.is_empty() {
        return Err(AgentError::Rejected(problems.join("; ")));
    }

    Ok(AgentEnvelope {
        evidence,
        sources,
        confidence,
        next_run,
        notification,
    })
}
