//! Error types for the inbound mail pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Queue item {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from the reply-generation collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("Responder {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Responder timed out after {0:?}")]
    Timeout(Duration),

    #[error("Responder {provider} returned an empty reply")]
    EmptyReply { provider: String },
}

/// Failures of a single queue item's unit of work.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Storage failed: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Responder failed: {0}")]
    Responder(#[from] ResponderError),

    #[error("No message body could be extracted")]
    EmptyBody,

    #[error("Payload is unparseable: {0}")]
    Unparseable(String),
}

impl PipelineError {
    /// Permanent failures skip the retry budget; retrying cannot change the payload.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Unparseable(_))
    }
}
