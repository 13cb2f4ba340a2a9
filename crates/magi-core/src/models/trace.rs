use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::AgentId;

/// One step of an agent execution trace, recorded for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub id: String,
    pub message_id: String,
    pub trace_id: String,
    /// 1-based position within the trace.
    pub step_number: u32,
    pub agent_id: AgentId,
    pub action: String,
    pub tools_used: Vec<String>,
    pub citations: Vec<String>,
    /// Duration in milliseconds.
    pub duration: u64,
    pub error_count: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}
