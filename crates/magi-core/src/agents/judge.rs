use chrono::Utc;

use crate::models::{AgentResponse, AgentScore, Decision, JudgeResponse, VotingResult};

/// Tally the sages' votes and render SOLOMON's verdict.
///
/// Majority of valid votes wins. A tie (possible when a sage abstained and
/// is absent from `responses`) goes to the side whose sages averaged the
/// higher confidence score, approval winning an exact score tie. Each sage
/// is scored 0-100 from its stated confidence.
pub fn judge(responses: &[AgentResponse], expected_voters: u32) -> JudgeResponse {
    let mut tally = VotingResult::default();
    for response in responses {
        match response.decision {
            Decision::Approved => tally.approved += 1,
            Decision::Rejected => tally.rejected += 1,
        }
    }
    tally.abstained = expected_voters.saturating_sub(tally.approved + tally.rejected);

    let final_decision = if tally.approved > tally.rejected {
        Decision::Approved
    } else if tally.rejected > tally.approved {
        Decision::Rejected
    } else {
        let side_average = |decision: Decision| {
            let voters = responses.iter().filter(|r| r.decision == decision);
            let sum: f64 = voters.clone().map(|r| (r.confidence * 100.0).round()).sum();
            sum / voters.count().max(1) as f64
        };
        if side_average(Decision::Approved) >= side_average(Decision::Rejected) {
            Decision::Approved
        } else {
            Decision::Rejected
        }
    };

    let scores: Vec<AgentScore> = responses
        .iter()
        .map(|response| {
            let aligned = response.decision == final_decision;
            let base = (response.confidence * 100.0).round() as u8;
            // Sages that voted against the final verdict lose a margin.
            let score = if aligned { base } else { base.saturating_sub(15) };
            AgentScore {
                agent_id: response.agent_id,
                score: score.min(100),
                reasoning: format!(
                    "{} voted {:?} with confidence {:.2}",
                    response.agent_id.as_str(),
                    response.decision,
                    response.confidence
                ),
            }
        })
        .collect();

    let confidence = if responses.is_empty() {
        0.0
    } else {
        responses.iter().map(|r| r.confidence).sum::<f64>() / responses.len() as f64
    };

    let summary = format!(
        "{} approved, {} rejected, {} abstained",
        tally.approved, tally.rejected, tally.abstained
    );
    let final_recommendation = match final_decision {
        Decision::Approved => "The proposal is approved by majority vote.".to_string(),
        Decision::Rejected => "The proposal is rejected; revise and resubmit.".to_string(),
    };
    let reasoning = format!(
        "Majority rule over valid votes (approval rate {:.0}%); ties go to the higher-scoring side.",
        tally.approval_rate() * 100.0
    );

    JudgeResponse {
        final_decision,
        voting_result: tally,
        scores,
        summary,
        final_recommendation,
        reasoning,
        confidence,
        execution_time: 0,
        timestamp: Utc::now(),
    }
}
