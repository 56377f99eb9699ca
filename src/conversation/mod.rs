//! Conversation threading: maps an inbound message onto an existing
//! conversation or starts a new one.

mod resolver;

use serde::{Deserialize, Serialize};

pub use resolver::{
    GENERATED_ID_DOMAIN, ResolvedThread, ThreadOutcome, ensure_message_id, resolve_thread,
};

/// An ordered chain of messages sharing one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub conversation_id: String,
    /// Message ids in arrival order.
    pub message_ids: Vec<String>,
}

impl ConversationThread {
    /// A fresh thread with a single member.
    pub fn start(message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            message_ids: vec![message_id.into()],
        }
    }
}
