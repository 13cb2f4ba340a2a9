pub mod agent;
pub mod conversation;
pub mod message;
pub mod trace;

pub use agent::{
    AgentId, AgentResponse, AgentScore, Decision, JudgeResponse, MagiDecision, VotingResult,
};
pub use conversation::{Conversation, ConversationPatch, NewConversation};
pub use message::{Message, NewMessage, Role};
pub use trace::TraceStep;
