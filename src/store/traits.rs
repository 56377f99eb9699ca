//! Storage boundaries: the queue and the conversation log.
//!
//! The pipeline only ever talks to these traits; [`LibSqlBackend`] is the
//! shipped implementation.
//!
//! [`LibSqlBackend`]: crate::store::LibSqlBackend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::conversation::ConversationThread;
use crate::error::DatabaseError;
use crate::ingest::{ExtractedEmail, RawDelivery};
use crate::queue::model::{QueueItem, QueueStats, StaleReset};

/// Persistence for queue items.
///
/// Status changes are checked against the item's current state; an illegal
/// move yields [`DatabaseError::InvalidTransition`] and leaves the row as is.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a new pending item.
    async fn enqueue(&self, delivery: &RawDelivery) -> Result<QueueItem, DatabaseError>;

    async fn get_item(&self, id: Uuid) -> Result<Option<QueueItem>, DatabaseError>;

    /// Oldest pending item, if any.
    async fn next_pending(&self) -> Result<Option<QueueItem>, DatabaseError>;

    async fn mark_processing(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn mark_completed(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Back to `pending` for a later retry, keeping the error for audit.
    async fn mark_pending(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Terminal failure.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Bump the attempt counter; returns the new value.
    async fn increment_attempts(&self, id: Uuid) -> Result<u32, DatabaseError>;

    /// Requeue items stuck in `processing` since before `stale_before`.
    ///
    /// The interrupted run counts as an attempt; items that reach
    /// `max_attempts` that way are failed instead.
    async fn reset_stale_processing(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<StaleReset, DatabaseError>;

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError>;
}

/// Whether a conversation record came in or went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

/// A stored conversation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub direction: Direction,
    pub email: ExtractedEmail,
    pub created_at: DateTime<Utc>,
}

/// Persistence for conversation threads.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Thread containing `message_id`. When the id appears more than once,
    /// the earliest-stored occurrence decides.
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<ConversationThread>, DatabaseError>;

    /// Append a message to a conversation, creating the conversation on
    /// first use.
    async fn append_message(
        &self,
        conversation_id: &str,
        email: &ExtractedEmail,
        direction: Direction,
    ) -> Result<(), DatabaseError>;

    /// Every record of a conversation in arrival order.
    async fn thread_history(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationRecord>, DatabaseError>;
}
