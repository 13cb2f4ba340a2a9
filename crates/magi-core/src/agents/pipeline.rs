use chrono::Utc;
use uuid::Uuid;

use crate::agents::{evaluate, judge};
use crate::error::{CoreError, CoreResult};
use crate::models::{AgentId, MagiDecision, TraceStep};

/// Run one full MAGI decision: evaluate the three sages, judge the votes,
/// and record a trace step per participant.
///
/// `message_id` is the assistant message the trace steps will hang off.
pub fn run_decision(question: &str, message_id: &str) -> CoreResult<MagiDecision> {
    let question = question.trim();
    if question.is_empty() {
        return Err(CoreError::validation("question cannot be empty"));
    }

    let request_id = Uuid::new_v4().to_string();
    let trace_id = Uuid::new_v4().to_string();

    let agent_responses: Vec<_> = AgentId::SAGES
        .iter()
        .map(|sage| evaluate(*sage, question))
        .collect();

    let mut trace_steps: Vec<TraceStep> = agent_responses
        .iter()
        .enumerate()
        .map(|(idx, response)| TraceStep {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            trace_id: trace_id.clone(),
            step_number: idx as u32 + 1,
            agent_id: response.agent_id,
            action: format!("evaluated question, voted {:?}", response.decision),
            tools_used: vec!["persona-eval".to_string()],
            citations: vec![],
            duration: response.execution_time,
            error_count: 0,
            timestamp: Utc::now(),
            metadata: serde_json::json!({ "confidence": response.confidence }),
        })
        .collect();

    let mut judge_response = judge(&agent_responses, AgentId::SAGES.len() as u32);
    // The judge's own cost is the tally step, negligible next to the sages.
    judge_response.execution_time = 5;

    trace_steps.push(TraceStep {
        id: Uuid::new_v4().to_string(),
        message_id: message_id.to_string(),
        trace_id: trace_id.clone(),
        step_number: trace_steps.len() as u32 + 1,
        agent_id: AgentId::Solomon,
        action: format!("tallied votes, final decision {:?}", judge_response.final_decision),
        tools_used: vec!["vote-tally".to_string()],
        citations: vec![],
        duration: judge_response.execution_time,
        error_count: 0,
        timestamp: Utc::now(),
        metadata: serde_json::Value::Null,
    });

    let total_execution_time = agent_responses
        .iter()
        .map(|r| r.execution_time)
        .max()
        .unwrap_or(0)
        + judge_response.execution_time;

    let decision = MagiDecision {
        request_id,
        trace_id,
        agent_responses,
        judge_response,
        trace_steps,
        total_execution_time,
    };
    decision.validate()?;
    Ok(decision)
}
