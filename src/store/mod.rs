//! Persistence layer: libSQL-backed queue and conversation storage.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ConversationRecord, ConversationStore, Direction, QueueStore};
