use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// The four MAGI personas. Three sages vote; SOLOMON judges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Caspar,
    Balthasar,
    Melchior,
    Solomon,
}

impl AgentId {
    /// The three voting sages, in canonical order.
    pub const SAGES: [AgentId; 3] = [AgentId::Caspar, AgentId::Balthasar, AgentId::Melchior];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Caspar => "caspar",
            AgentId::Balthasar => "balthasar",
            AgentId::Melchior => "melchior",
            AgentId::Solomon => "solomon",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AgentId::Solomon => "SOLOMON Judge - tallies the three sages' votes and renders the final decision",
            AgentId::Caspar => "CASPAR - conservative, risk-focused perspective",
            AgentId::Balthasar => "BALTHASAR - innovative, creativity-focused perspective",
            AgentId::Melchior => "MELCHIOR - balanced, scientific perspective",
        }
    }
}

/// Outcome of a vote or of the final judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Rejected,
}

/// One sage's answer to a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub agent_id: AgentId,
    pub decision: Decision,
    pub content: String,
    pub reasoning: String,
    /// Confidence in [0.0, 1.0].
    pub confidence: f64,
    /// Wall time in milliseconds.
    pub execution_time: u64,
    pub timestamp: DateTime<Utc>,
}

/// SOLOMON's 0-100 score for one sage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentScore {
    pub agent_id: AgentId,
    pub score: u8,
    pub reasoning: String,
}

/// Vote tally across the three sages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingResult {
    pub approved: u32,
    pub rejected: u32,
    pub abstained: u32,
}

impl VotingResult {
    pub fn total_votes(&self) -> u32 {
        self.approved + self.rejected + self.abstained
    }

    /// Approval rate over valid (non-abstained) votes. Zero valid votes -> 0.0.
    pub fn approval_rate(&self) -> f64 {
        let valid = self.approved + self.rejected;
        if valid == 0 {
            return 0.0;
        }
        f64::from(self.approved) / f64::from(valid)
    }
}

/// SOLOMON's aggregate verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResponse {
    pub final_decision: Decision,
    pub voting_result: VotingResult,
    pub scores: Vec<AgentScore>,
    pub summary: String,
    pub final_recommendation: String,
    pub reasoning: String,
    pub confidence: f64,
    pub execution_time: u64,
    pub timestamp: DateTime<Utc>,
}

/// Full result of one decision run: the three sage responses, the judge's
/// verdict, and the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MagiDecision {
    pub request_id: String,
    pub trace_id: String,
    pub agent_responses: Vec<AgentResponse>,
    pub judge_response: JudgeResponse,
    pub trace_steps: Vec<crate::models::TraceStep>,
    pub total_execution_time: u64,
}

impl MagiDecision {
    /// A decision must carry exactly the three sages, no more, no less.
    pub fn validate(&self) -> CoreResult<()> {
        let mut seen: Vec<AgentId> = Vec::with_capacity(3);
        for response in &self.agent_responses {
            if response.agent_id == AgentId::Solomon {
                return Err(CoreError::validation("solomon cannot appear among sage responses"));
            }
            if seen.contains(&response.agent_id) {
                return Err(CoreError::validation(format!(
                    "duplicate sage response: {}",
                    response.agent_id.as_str()
                )));
            }
            seen.push(response.agent_id);
        }
        for sage in AgentId::SAGES {
            if !seen.contains(&sage) {
                return Err(CoreError::validation(format!(
                    "missing sage response: {}",
                    sage.as_str()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sage_response(agent_id: AgentId) -> AgentResponse {
        AgentResponse {
            agent_id,
            decision: Decision::Approved,
            content: "content".to_string(),
            reasoning: "reasoning".to_string(),
            confidence: 0.8,
            execution_time: 10,
            timestamp: Utc::now(),
        }
    }

    fn decision_with(agents: &[AgentId]) -> MagiDecision {
        MagiDecision {
            request_id: "req".to_string(),
            trace_id: "trace".to_string(),
            agent_responses: agents.iter().map(|a| sage_response(*a)).collect(),
            judge_response: JudgeResponse {
                final_decision: Decision::Approved,
                voting_result: VotingResult { approved: 3, rejected: 0, abstained: 0 },
                scores: vec![],
                summary: String::new(),
                final_recommendation: String::new(),
                reasoning: String::new(),
                confidence: 0.9,
                execution_time: 5,
                timestamp: Utc::now(),
            },
            trace_steps: vec![],
            total_execution_time: 15,
        }
    }

    #[test]
    fn test_voting_result_rates() {
        let tally = VotingResult { approved: 2, rejected: 1, abstained: 0 };
        assert_eq!(tally.total_votes(), 3);
        assert!((tally.approval_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_abstains_excluded_from_approval_rate() {
        let tally = VotingResult { approved: 1, rejected: 1, abstained: 1 };
        assert_eq!(tally.total_votes(), 3);
        assert!((tally.approval_rate() - 0.5).abs() < 1e-9);

        let all_abstained = VotingResult { approved: 0, rejected: 0, abstained: 3 };
        assert_eq!(all_abstained.approval_rate(), 0.0);
    }

    #[test]
    fn test_validate_requires_all_three_sages() {
        assert!(decision_with(&AgentId::SAGES).validate().is_ok());
        assert!(decision_with(&[AgentId::Caspar, AgentId::Balthasar]).validate().is_err());
        assert!(decision_with(&[AgentId::Caspar, AgentId::Caspar, AgentId::Melchior])
            .validate()
            .is_err());
        assert!(decision_with(&[AgentId::Caspar, AgentId::Balthasar, AgentId::Solomon])
            .validate()
            .is_err());
    }
}
