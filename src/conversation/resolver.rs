use tracing::debug;
use uuid::Uuid;

use super::ConversationThread;
use crate::error::DatabaseError;
use crate::ingest::ExtractedEmail;
use crate::store::ConversationStore;

/// Domain of ids minted for messages that arrive without a `Message-ID`.
pub const GENERATED_ID_DOMAIN: &str = "inbound.local";

/// How a message ended up in its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadOutcome {
    /// No resolvable parent; a new conversation.
    Started,
    /// Appended to the parent's conversation.
    Joined,
    /// This message id is already stored (redelivery after a crash).
    AlreadyRecorded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedThread {
    pub thread: ConversationThread,
    pub outcome: ThreadOutcome,
}

/// Give the email a message id if it has none, and return it.
///
/// The minted id is derived from `seed`, so a retried queue item gets the
/// same id on every attempt.
pub fn ensure_message_id(email: &mut ExtractedEmail, seed: Uuid) -> &str {
    email
        .message_id
        .get_or_insert_with(|| format!("generated-{seed}@{GENERATED_ID_DOMAIN}"))
}

/// Find the conversation this email belongs to.
///
/// `In-Reply-To` is tried first, then `References` from most recent to
/// oldest. The first id the store knows decides the thread. Nothing is
/// written; the returned thread already lists the email's own id last.
/// An email without a message id gets a random one; callers that retry
/// should call [`ensure_message_id`] first.
pub async fn resolve_thread(
    email: &mut ExtractedEmail,
    lookup: &dyn ConversationStore,
) -> Result<ResolvedThread, DatabaseError> {
    let own_id = ensure_message_id(email, Uuid::new_v4()).to_string();

    if let Some(thread) = lookup.find_by_message_id(&own_id).await? {
        debug!(message_id = %own_id, conversation_id = %thread.conversation_id, "Message already threaded");
        return Ok(ResolvedThread {
            thread,
            outcome: ThreadOutcome::AlreadyRecorded,
        });
    }

    let references = email.reference_ids();
    let candidates = email
        .in_reply_to
        .iter()
        .cloned()
        .chain(references.into_iter().rev())
        .filter(|id| *id != own_id);

    for parent in candidates {
        if let Some(mut thread) = lookup.find_by_message_id(&parent).await? {
            thread.message_ids.push(own_id.clone());
            debug!(
                message_id = %own_id,
                parent = %parent,
                conversation_id = %thread.conversation_id,
                "Joined existing conversation"
            );
            return Ok(ResolvedThread {
                thread,
                outcome: ThreadOutcome::Joined,
            });
        }
    }

    let thread = ConversationThread::start(own_id);
    debug!(conversation_id = %thread.conversation_id, "Started new conversation");
    Ok(ResolvedThread {
        thread,
        outcome: ThreadOutcome::Started,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Direction, LibSqlBackend};

    fn email(message_id: Option<&str>, in_reply_to: Option<&str>) -> ExtractedEmail {
        ExtractedEmail {
            sender: "jane@example.com".into(),
            subject: "Hello".into(),
            body: "Hi".into(),
            message_id: message_id.map(str::to_string),
            in_reply_to: in_reply_to.map(str::to_string),
            references: None,
        }
    }

    async fn record(db: &LibSqlBackend, email: &mut ExtractedEmail) -> ResolvedThread {
        let resolved = resolve_thread(email, db).await.unwrap();
        db.append_message(&resolved.thread.conversation_id, email, Direction::Incoming)
            .await
            .unwrap();
        resolved
    }

    #[tokio::test]
    async fn reply_joins_parent_thread() {
        let db = LibSqlBackend::new_memory().await.unwrap();

        let mut a = email(Some("a@example.com"), None);
        let first = record(&db, &mut a).await;
        assert_eq!(first.outcome, ThreadOutcome::Started);
        assert_eq!(first.thread.message_ids, vec!["a@example.com"]);

        let mut b = email(Some("b@example.com"), Some("a@example.com"));
        let second = record(&db, &mut b).await;
        assert_eq!(second.outcome, ThreadOutcome::Joined);
        assert_eq!(second.thread.conversation_id, first.thread.conversation_id);
        assert_eq!(second.thread.message_ids, vec!["a@example.com", "b@example.com"]);
    }

    #[tokio::test]
    async fn unknown_parent_starts_new_thread() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut b = email(Some("b@x"), Some("never-seen@x"));
        let resolved = resolve_thread(&mut b, &db).await.unwrap();
        assert_eq!(resolved.outcome, ThreadOutcome::Started);
        assert_eq!(resolved.thread.message_ids, vec!["b@x"]);
    }

    #[tokio::test]
    async fn references_used_when_in_reply_to_unresolvable() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut root = email(Some("root@x"), None);
        let root_thread = record(&db, &mut root).await;

        let mut c = email(Some("c@x"), Some("missing@x"));
        c.references = Some("<root@x> <missing@x>".into());
        let resolved = resolve_thread(&mut c, &db).await.unwrap();
        assert_eq!(resolved.outcome, ThreadOutcome::Joined);
        assert_eq!(resolved.thread.conversation_id, root_thread.thread.conversation_id);
    }

    #[tokio::test]
    async fn missing_message_id_is_generated() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut anon = email(None, None);
        let resolved = resolve_thread(&mut anon, &db).await.unwrap();

        let id = anon.message_id.clone().unwrap();
        assert!(id.starts_with("generated-"));
        assert!(id.ends_with(&format!("@{GENERATED_ID_DOMAIN}")));
        assert_eq!(resolved.thread.message_ids, vec![id]);
    }

    #[tokio::test]
    async fn redelivered_message_is_not_appended_twice() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut a = email(Some("a@x"), None);
        let first = record(&db, &mut a).await;

        let mut again = email(Some("a@x"), None);
        let resolved = resolve_thread(&mut again, &db).await.unwrap();
        assert_eq!(resolved.outcome, ThreadOutcome::AlreadyRecorded);
        assert_eq!(resolved.thread, first.thread);
    }

    #[test]
    fn ensure_message_id_keeps_existing() {
        let mut e = email(Some("keep@x"), None);
        assert_eq!(ensure_message_id(&mut e, Uuid::new_v4()), "keep@x");
    }

    #[test]
    fn ensure_message_id_is_stable_for_a_seed() {
        let seed = Uuid::new_v4();
        let mut first = email(None, None);
        let mut second = email(None, None);
        assert_eq!(
            ensure_message_id(&mut first, seed),
            ensure_message_id(&mut second, seed)
        );
    }
}
