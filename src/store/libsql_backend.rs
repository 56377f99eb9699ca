//! libSQL backend: async [`QueueStore`] and [`ConversationStore`]
//! implementation. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversation::ConversationThread;
use crate::error::DatabaseError;
use crate::ingest::{ExtractedEmail, RawDelivery};
use crate::queue::model::{QueueItem, QueueStats, QueueStatus, StaleReset};
use crate::store::migrations;
use crate::store::traits::{ConversationRecord, ConversationStore, Direction, QueueStore};

/// Error recorded on items recovered from an interrupted run.
pub const STALE_PROCESSING_ERROR: &str = "stale processing";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Guarded status update: only rows currently in a legal source state
    /// move. Zero affected rows means the item is missing or the move is
    /// illegal; the follow-up read tells which.
    async fn transition(
        &self,
        id: Uuid,
        to: QueueStatus,
        last_error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let sources = QueueStatus::sources(to)
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE queue_items
                     SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3
                     WHERE id = ?4 AND status IN ({sources})"
                ),
                params![to.as_str(), opt_text(last_error), ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition: {e}")))?;

        if changed == 0 {
            return Err(match self.get_item(id).await? {
                None => DatabaseError::NotFound {
                    entity: "queue_item".into(),
                    id: id.to_string(),
                },
                Some(item) => DatabaseError::InvalidTransition {
                    id,
                    from: item.status.to_string(),
                    to: to.to_string(),
                },
            });
        }

        debug!(item_id = %id, status = %to, "Queue item transitioned");
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339, so string order is time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const QUEUE_COLUMNS: &str =
    "id, payload, content_type, received_at, status, attempt_count, last_error, created_at, updated_at";

/// Map a libsql Row to a QueueItem.
///
/// Column order matches QUEUE_COLUMNS.
fn row_to_item(row: &libsql::Row) -> Result<QueueItem, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("queue row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse_err)?;
    let bytes = match row.get_value(1).map_err(parse_err)? {
        libsql::Value::Blob(b) => b,
        libsql::Value::Text(s) => s.into_bytes(),
        _ => Vec::new(),
    };
    let content_type: Option<String> = row.get(2).ok();
    let received_str: String = row.get(3).map_err(parse_err)?;
    let status_str: String = row.get(4).map_err(parse_err)?;
    let attempts: i64 = row.get(5).map_err(parse_err)?;
    let last_error: Option<String> = row.get(6).ok();
    let created_str: String = row.get(7).map_err(parse_err)?;
    let updated_str: String = row.get(8).map_err(parse_err)?;

    let status = status_str
        .parse::<QueueStatus>()
        .map_err(DatabaseError::Serialization)?;

    Ok(QueueItem {
        id: id_str
            .parse()
            .map_err(|e| DatabaseError::Serialization(format!("queue item id: {e}")))?,
        payload: RawDelivery {
            bytes,
            content_type,
            received_at: parse_datetime(&received_str),
        },
        status,
        attempt_count: u32::try_from(attempts).unwrap_or(0),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        last_error,
    })
}

const RECORD_COLUMNS: &str =
    "conversation_id, message_id, direction, sender, subject, body, in_reply_to, message_references, created_at";

fn row_to_record(row: &libsql::Row) -> Result<ConversationRecord, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("conversation row parse: {e}"));

    let direction_str: String = row.get(2).map_err(parse_err)?;
    let created_str: String = row.get(8).map_err(parse_err)?;

    Ok(ConversationRecord {
        conversation_id: row.get(0).map_err(parse_err)?,
        direction: match direction_str.as_str() {
            "outgoing" => Direction::Outgoing,
            _ => Direction::Incoming,
        },
        email: ExtractedEmail {
            sender: row.get(3).map_err(parse_err)?,
            subject: row.get(4).map_err(parse_err)?,
            body: row.get(5).map_err(parse_err)?,
            message_id: row.get::<String>(1).ok(),
            in_reply_to: row.get::<String>(6).ok(),
            references: row.get::<String>(7).ok(),
        },
        created_at: parse_datetime(&created_str),
    })
}

// ── Queue ───────────────────────────────────────────────────────────

#[async_trait]
impl QueueStore for LibSqlBackend {
    async fn enqueue(&self, delivery: &RawDelivery) -> Result<QueueItem, DatabaseError> {
        let item = QueueItem::new(delivery.clone());
        self.conn()
            .execute(
                "INSERT INTO queue_items (id, payload, content_type, received_at, status,
                    attempt_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
                params![
                    item.id.to_string(),
                    libsql::Value::Blob(delivery.bytes.clone()),
                    opt_text(delivery.content_type.as_deref()),
                    ts(delivery.received_at),
                    ts(item.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(item_id = %item.id, bytes = delivery.bytes.len(), "Queue item enqueued");
        Ok(item)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<QueueItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {QUEUE_COLUMNS} FROM queue_items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_item: {e}"))),
        }
    }

    async fn next_pending(&self) -> Result<Option<QueueItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queue_items WHERE status = 'pending' ORDER BY seq ASC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("next_pending: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("next_pending: {e}"))),
        }
    }

    async fn mark_processing(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.transition(id, QueueStatus::Processing, None).await
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.transition(id, QueueStatus::Completed, None).await
    }

    async fn mark_pending(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.transition(id, QueueStatus::Pending, Some(error)).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.transition(id, QueueStatus::Failed, Some(error)).await
    }

    async fn increment_attempts(&self, id: Uuid) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE queue_items SET attempt_count = attempt_count + 1, updated_at = ?1
                 WHERE id = ?2 AND status NOT IN ('completed', 'failed')
                 RETURNING attempt_count",
                params![ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_attempts: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("increment_attempts: {e}")))?;
                Ok(u32::try_from(count).unwrap_or(u32::MAX))
            }
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "active queue_item".into(),
                id: id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("increment_attempts: {e}"))),
        }
    }

    async fn reset_stale_processing(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<StaleReset, DatabaseError> {
        let conn = self.conn();
        let now = ts(Utc::now());
        let cutoff = ts(stale_before);

        // Exhausted items first, so the requeue below only sees the rest
        let failed = conn
            .execute(
                "UPDATE queue_items
                 SET status = 'failed', attempt_count = attempt_count + 1, last_error = ?1, updated_at = ?2
                 WHERE status = 'processing' AND updated_at < ?3 AND attempt_count + 1 >= ?4",
                params![STALE_PROCESSING_ERROR, now.clone(), cutoff.clone(), i64::from(max_attempts)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_stale_processing: {e}")))?;

        let requeued = conn
            .execute(
                "UPDATE queue_items
                 SET status = 'pending', attempt_count = attempt_count + 1, last_error = ?1, updated_at = ?2
                 WHERE status = 'processing' AND updated_at < ?3",
                params![STALE_PROCESSING_ERROR, now, cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_stale_processing: {e}")))?;

        let reset = StaleReset { requeued, failed };
        if !reset.is_empty() {
            warn!(requeued, failed, "Recovered stale processing items");
        }
        Ok(reset)
    }

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM queue_items GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?;
            let count: i64 = row.get(1).unwrap_or(0);
            if let Ok(status) = status.parse::<QueueStatus>() {
                stats.add(status, u64::try_from(count).unwrap_or(0));
            }
        }
        Ok(stats)
    }
}

// ── Conversations ───────────────────────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<ConversationThread>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT conversation_id FROM conversation_messages
                 WHERE message_id = ?1 ORDER BY seq ASC LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_message_id: {e}")))?;

        let conversation_id: String = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("find_by_message_id: {e}")))?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("find_by_message_id: {e}"))),
        };

        let mut rows = conn
            .query(
                "SELECT message_id FROM conversation_messages
                 WHERE conversation_id = ?1 AND message_id IS NOT NULL ORDER BY seq ASC",
                params![conversation_id.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_message_id: {e}")))?;

        let mut message_ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_message_id: {e}")))?
        {
            if let Ok(id) = row.get::<String>(0) {
                message_ids.push(id);
            }
        }

        Ok(Some(ConversationThread {
            conversation_id,
            message_ids,
        }))
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        email: &ExtractedEmail,
        direction: Direction,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = ts(Utc::now());

        conn.execute(
            "INSERT INTO conversations (id, created_at, last_activity) VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET last_activity = excluded.last_activity",
            params![conversation_id, now.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;

        conn.execute(
            "INSERT INTO conversation_messages (conversation_id, message_id, direction, sender,
                subject, body, in_reply_to, message_references, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                conversation_id,
                opt_text(email.message_id.as_deref()),
                direction.as_str(),
                email.sender.as_str(),
                email.subject.as_str(),
                email.body.as_str(),
                opt_text(email.in_reply_to.as_deref()),
                opt_text(email.references.as_deref()),
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;

        debug!(
            conversation_id,
            direction = direction.as_str(),
            message_id = email.message_id.as_deref().unwrap_or(""),
            "Conversation message stored"
        );
        Ok(())
    }

    async fn thread_history(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM conversation_messages
                     WHERE conversation_id = ?1 ORDER BY seq ASC"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("thread_history: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("thread_history: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
