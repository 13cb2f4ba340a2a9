use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::models::{AgentId, AgentResponse, Decision};

/// Approval threshold per persona, applied to the first hash byte.
/// Higher threshold = harder to approve. CASPAR is the most conservative,
/// BALTHASAR the most permissive, MELCHIOR sits between them.
fn approval_threshold(agent: AgentId) -> u8 {
    match agent {
        AgentId::Caspar => 150,
        AgentId::Balthasar => 90,
        AgentId::Melchior => 120,
        AgentId::Solomon => 128,
    }
}

fn digest(agent: AgentId, question: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(agent.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(question.as_bytes());
    hasher.finalize().into()
}

fn rationale(agent: AgentId, decision: Decision) -> (&'static str, &'static str) {
    match (agent, decision) {
        (AgentId::Caspar, Decision::Approved) => (
            "The practical risks are acceptable and the downside is bounded.",
            "From a conservative standpoint, the proposal carries no irreversible consequences.",
        ),
        (AgentId::Caspar, Decision::Rejected) => (
            "The risk profile outweighs the expected benefit.",
            "A conservative reading finds too many unmitigated failure modes.",
        ),
        (AgentId::Balthasar, Decision::Approved) => (
            "This opens genuinely new ground and deserves a chance.",
            "The creative upside dominates; hesitation here costs more than failure would.",
        ),
        (AgentId::Balthasar, Decision::Rejected) => (
            "Even by a generous reading, the idea lacks a spark worth pursuing.",
            "Novelty alone does not justify the effort this would demand.",
        ),
        (AgentId::Melchior, Decision::Approved) => (
            "The evidence, on balance, supports proceeding.",
            "Weighing measurable costs against measurable gains, approval is the rational call.",
        ),
        (AgentId::Melchior, Decision::Rejected) => (
            "The available evidence does not support proceeding.",
            "The expected value is negative once second-order effects are priced in.",
        ),
        // Solomon does not vote; it only judges.
        (AgentId::Solomon, _) => ("", ""),
    }
}

/// Produce one sage's deterministic response to a question.
pub fn evaluate(agent: AgentId, question: &str) -> AgentResponse {
    let bytes = digest(agent, question);

    let decision = if bytes[0] >= approval_threshold(agent) {
        Decision::Approved
    } else {
        Decision::Rejected
    };

    // Confidence in [0.55, 0.94], execution time in [40, 360) ms.
    let confidence = 0.55 + f64::from(bytes[1] % 40) / 100.0;
    let execution_time = 40 + u64::from(bytes[2]) + u64::from(bytes[3] % 104);

    let (content, reasoning) = rationale(agent, decision);

    AgentResponse {
        agent_id: agent,
        decision,
        content: content.to_string(),
        reasoning: reasoning.to_string(),
        confidence,
        execution_time,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_is_deterministic() {
        let a = evaluate(AgentId::Caspar, "Should we ship on Friday?");
        let b = evaluate(AgentId::Caspar, "Should we ship on Friday?");
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.execution_time, b.execution_time);
    }

    #[test]
    fn test_confidence_in_range() {
        for question in ["a", "b", "c", "a longer question about something"] {
            for sage in AgentId::SAGES {
                let response = evaluate(sage, question);
                assert!(response.confidence >= 0.0 && response.confidence <= 1.0);
                assert!(!response.content.is_empty());
                assert!(!response.reasoning.is_empty());
            }
        }
    }

    #[test]
    fn test_personas_can_disagree() {
        // Run enough questions that at least one splits the vote; the
        // personas carry different approval thresholds so splits must occur.
        let mut saw_disagreement = false;
        for i in 0..64 {
            let question = format!("sample question {i}");
            let decisions: Vec<Decision> = AgentId::SAGES
                .iter()
                .map(|sage| evaluate(*sage, &question).decision)
                .collect();
            if decisions.iter().any(|d| *d != decisions[0]) {
                saw_disagreement = true;
                break;
            }
        }
        assert!(saw_disagreement);
    }
}
