use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AgentResponse, JudgeResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A chat message. Assistant messages produced by the MAGI pipeline carry
/// the per-sage responses and SOLOMON's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_responses: Option<Vec<AgentResponse>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_response: Option<JudgeResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn optimistic(input: &NewMessage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: input.conversation_id.clone(),
            role: input.role,
            content: input.content.clone(),
            agent_responses: None,
            judge_response: None,
            trace_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Input for creating a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimistic_message_has_unique_id() {
        let input = NewMessage {
            conversation_id: "conv-1".to_string(),
            role: Role::User,
            content: "hello".to_string(),
        };
        let a = Message::optimistic(&input);
        let b = Message::optimistic(&input);
        assert_ne!(a.id, b.id);
        assert_eq!(a.conversation_id, "conv-1");
        assert!(a.agent_responses.is_none());
    }
}
