use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat conversation. Server-authoritative; the client may hold an
/// optimistic copy with a temporary id until reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub agent_preset_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Build an optimistic local copy with a temporary id and client-side
    /// timestamps. The id is replaced by the server copy at reconciliation.
    pub fn optimistic(input: &NewConversation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id.clone(),
            title: input.title.clone(),
            agent_preset_id: input.agent_preset_id.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a field-level patch: only provided fields change, `updated_at`
    /// is refreshed locally.
    pub fn apply_patch(&mut self, patch: &ConversationPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(preset) = &patch.agent_preset_id {
            self.agent_preset_id = preset.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// Input for creating a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub user_id: String,
    pub title: String,
    pub agent_preset_id: Option<String>,
}

/// Field-level update. `None` means "leave unchanged"; for the nullable
/// preset reference, `Some(None)` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    pub id: String,
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_preset_id: Option<Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_only_touches_provided_fields() {
        let mut conversation = Conversation::optimistic(&NewConversation {
            user_id: "user-1".to_string(),
            title: "Old".to_string(),
            agent_preset_id: Some("preset-1".to_string()),
        });
        let before_updated = conversation.updated_at;

        conversation.apply_patch(&ConversationPatch {
            id: conversation.id.clone(),
            title: Some("New".to_string()),
            agent_preset_id: None,
        });

        assert_eq!(conversation.title, "New");
        assert_eq!(conversation.agent_preset_id.as_deref(), Some("preset-1"));
        assert!(conversation.updated_at >= before_updated);
    }

    #[test]
    fn test_patch_can_clear_preset() {
        let mut conversation = Conversation::optimistic(&NewConversation {
            user_id: "user-1".to_string(),
            title: "T".to_string(),
            agent_preset_id: Some("preset-1".to_string()),
        });

        conversation.apply_patch(&ConversationPatch {
            id: conversation.id.clone(),
            title: None,
            agent_preset_id: Some(None),
        });

        assert!(conversation.agent_preset_id.is_none());
        assert_eq!(conversation.title, "T");
    }
}
