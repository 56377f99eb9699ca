//! Per-item unit of work and the retry state machine.
//!
//! Each call to [`QueueProcessor::process_next`] claims the oldest pending
//! item, runs the whole pipeline for it and settles its status:
//!
//! - success or duplicate → `completed`
//! - permanent failure → `failed`, no attempt consumed
//! - any other failure → attempt counted; `pending` while attempts remain,
//!   `failed` once `max_attempts` is reached

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dedup::{DedupGate, DedupKey};
use super::model::{QueueItem, StaleReset};
use crate::config::{EmptyBodyPolicy, IngestConfig};
use crate::conversation::{ThreadOutcome, ensure_message_id, resolve_thread};
use crate::error::{DatabaseError, PipelineError, ResponderError};
use crate::ingest::{ExtractedEmail, prepare};
use crate::responder::{REPLY_SENDER, Responder, reply_subject};
use crate::store::{ConversationStore, Direction, QueueStore};

/// Settings the processor needs from [`IngestConfig`].
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub max_attempts: u32,
    pub responder_timeout: Duration,
    pub empty_body_policy: EmptyBodyPolicy,
    pub stale_processing_after: Duration,
}

impl From<&IngestConfig> for ProcessorSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            responder_timeout: config.responder_timeout,
            empty_body_policy: config.empty_body_policy,
            stale_processing_after: config.stale_processing_after,
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

/// How one item was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Pipeline ran to the end.
    Completed,
    /// Dedup gate matched; acknowledged without extraction.
    Duplicate,
    /// Back to pending; `attempt` failures so far.
    Retrying { attempt: u32, error: String },
    /// Terminal.
    Failed { attempt: u32, error: String },
}

/// Successful pipeline results.
enum RunResult {
    Completed,
    Duplicate,
}

/// Runs queue items through extraction, threading and the responder.
pub struct QueueProcessor {
    queue: Arc<dyn QueueStore>,
    conversations: Arc<dyn ConversationStore>,
    responder: Arc<dyn Responder>,
    dedup: Arc<dyn DedupGate>,
    settings: ProcessorSettings,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        conversations: Arc<dyn ConversationStore>,
        responder: Arc<dyn Responder>,
        dedup: Arc<dyn DedupGate>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            queue,
            conversations,
            responder,
            dedup,
            settings,
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Requeue (or fail) items stuck in `processing` as of `now`.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<StaleReset, DatabaseError> {
        let threshold = chrono::Duration::from_std(self.settings.stale_processing_after)
            .unwrap_or(chrono::Duration::MAX);
        let stale_before = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.queue
            .reset_stale_processing(stale_before, self.settings.max_attempts)
            .await
    }

    /// Claim and fully process the oldest pending item.
    ///
    /// Returns `None` when the queue is empty. Storage errors while settling
    /// the item are returned; the item then stays `processing` until stale
    /// recovery picks it up.
    pub async fn process_next(&self) -> Result<Option<(Uuid, ItemOutcome)>, DatabaseError> {
        let Some(item) = self.queue.next_pending().await? else {
            return Ok(None);
        };

        // Claim before any extraction work starts
        self.queue.mark_processing(item.id).await?;
        debug!(item_id = %item.id, attempt = item.attempt_count + 1, "Processing queue item");

        let outcome = match self.run(&item).await {
            Ok(result) => {
                self.queue.mark_completed(item.id).await?;
                match result {
                    RunResult::Completed => {
                        info!(item_id = %item.id, "Queue item completed");
                        ItemOutcome::Completed
                    }
                    RunResult::Duplicate => {
                        info!(item_id = %item.id, "Duplicate delivery acknowledged");
                        ItemOutcome::Duplicate
                    }
                }
            }
            Err(e) => self.settle_failure(&item, e).await?,
        };

        Ok(Some((item.id, outcome)))
    }

    async fn settle_failure(
        &self,
        item: &QueueItem,
        err: PipelineError,
    ) -> Result<ItemOutcome, DatabaseError> {
        let message = err.to_string();

        if err.is_permanent() {
            self.queue.mark_failed(item.id, &message).await?;
            error!(item_id = %item.id, error = %message, "Queue item failed permanently");
            return Ok(ItemOutcome::Failed {
                attempt: item.attempt_count,
                error: message,
            });
        }

        let attempt = self.queue.increment_attempts(item.id).await?;
        if attempt < self.settings.max_attempts {
            self.queue.mark_pending(item.id, &message).await?;
            warn!(
                item_id = %item.id,
                attempt,
                max_attempts = self.settings.max_attempts,
                error = %message,
                "Queue item failed; will retry"
            );
            Ok(ItemOutcome::Retrying {
                attempt,
                error: message,
            })
        } else {
            self.queue.mark_failed(item.id, &message).await?;
            error!(item_id = %item.id, attempt, error = %message, "Queue item exhausted its retries");
            Ok(ItemOutcome::Failed {
                attempt,
                error: message,
            })
        }
    }

    /// The pipeline proper. Component steps never fail on malformed input;
    /// only storage, the responder and the policies below produce errors.
    async fn run(&self, item: &QueueItem) -> Result<RunResult, PipelineError> {
        let prepared = prepare(&item.payload);
        // Relay redeliveries arrive later but carry the same send time
        let key = DedupKey::new(
            prepared.delivered_at.unwrap_or(item.payload.received_at),
            prepared.sender(),
            prepared.subject(),
            prepared.threading.message_id.as_deref(),
        );

        if !self.dedup.should_process(&key) {
            return Ok(RunResult::Duplicate);
        }

        let kind = prepared.kind;
        let mut email = prepared.extract()?;
        debug!(
            item_id = %item.id,
            kind,
            sender = %email.sender,
            body_len = email.body.len(),
            "Message extracted"
        );

        if email.body.is_empty() && self.settings.empty_body_policy == EmptyBodyPolicy::Retry {
            return Err(PipelineError::EmptyBody);
        }

        ensure_message_id(&mut email, item.id);
        let resolved = resolve_thread(&mut email, self.conversations.as_ref()).await?;
        let conversation_id = resolved.thread.conversation_id.clone();
        if resolved.outcome != ThreadOutcome::AlreadyRecorded {
            self.conversations
                .append_message(&conversation_id, &email, Direction::Incoming)
                .await?;
        }

        if email.body.is_empty() {
            info!(item_id = %item.id, conversation_id = %conversation_id, "Empty body; thread recorded, no reply");
            self.dedup.mark_processed(key);
            return Ok(RunResult::Completed);
        }

        let own_id = email.message_id.clone().unwrap_or_default();
        let records = self.conversations.thread_history(&conversation_id).await?;

        let already_answered = records.iter().any(|r| {
            r.direction == Direction::Outgoing && r.email.in_reply_to.as_deref() == Some(own_id.as_str())
        });
        if already_answered {
            self.dedup.mark_processed(key);
            return Ok(RunResult::Duplicate);
        }

        let history: Vec<ExtractedEmail> = records
            .into_iter()
            .filter(|r| !(r.direction == Direction::Incoming && r.email.message_id.as_deref() == Some(own_id.as_str())))
            .map(|r| r.email)
            .collect();

        let reply = tokio::time::timeout(
            self.settings.responder_timeout,
            self.responder.generate_reply(&email, &history),
        )
        .await
        .map_err(|_| ResponderError::Timeout(self.settings.responder_timeout))??;

        let outgoing = ExtractedEmail {
            sender: REPLY_SENDER.to_string(),
            subject: reply_subject(&email.subject),
            body: reply,
            message_id: None,
            in_reply_to: Some(own_id),
            references: email.references.clone(),
        };
        self.conversations
            .append_message(&conversation_id, &outgoing, Direction::Outgoing)
            .await?;

        info!(
            item_id = %item.id,
            conversation_id = %conversation_id,
            responder = self.responder.name(),
            "Reply recorded"
        );
        self.dedup.mark_processed(key);
        Ok(RunResult::Completed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::ingest::RawDelivery;
    use crate::queue::dedup::LruDedupGate;
    use crate::queue::model::QueueStatus;
    use crate::store::LibSqlBackend;

    /// Records every call; replies with a fixed text.
    #[derive(Default)]
    pub(crate) struct RecordingResponder {
        pub calls: Mutex<Vec<(ExtractedEmail, Vec<ExtractedEmail>)>>,
    }

    #[async_trait]
    impl Responder for RecordingResponder {
        fn name(&self) -> &str {
            "recording"
        }

        async fn generate_reply(
            &self,
            email: &ExtractedEmail,
            history: &[ExtractedEmail],
        ) -> Result<String, ResponderError> {
            self.calls
                .lock()
                .unwrap()
                .push((email.clone(), history.to_vec()));
            Ok(format!("Thanks for your note about {}", email.subject))
        }
    }

    struct FailingResponder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Responder for FailingResponder {
        fn name(&self) -> &str {
            "failing"
        }

        async fn generate_reply(
            &self,
            _email: &ExtractedEmail,
            _history: &[ExtractedEmail],
        ) -> Result<String, ResponderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ResponderError::RequestFailed {
                provider: "failing".into(),
                reason: "503 from upstream".into(),
            })
        }
    }

    struct HangingResponder;

    #[async_trait]
    impl Responder for HangingResponder {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn generate_reply(
            &self,
            _email: &ExtractedEmail,
            _history: &[ExtractedEmail],
        ) -> Result<String, ResponderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("too late".into())
        }
    }

    pub(crate) fn form(parts: &[(&str, &str)]) -> RawDelivery {
        let mut out = String::new();
        for (name, value) in parts {
            out.push_str(&format!(
                "--xYzZY\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        out.push_str("--xYzZY--\r\n");
        RawDelivery::new(out, Some("multipart/form-data; boundary=xYzZY"))
    }

    fn processor(
        db: Arc<LibSqlBackend>,
        responder: Arc<dyn Responder>,
        settings: ProcessorSettings,
    ) -> QueueProcessor {
        QueueProcessor::new(
            db.clone(),
            db,
            responder,
            Arc::new(LruDedupGate::new(100, Duration::from_secs(3600))),
            settings,
        )
    }

    async fn setup(responder: Arc<dyn Responder>) -> (Arc<LibSqlBackend>, QueueProcessor) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let p = processor(db.clone(), responder, ProcessorSettings::default());
        (db, p)
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let (_db, p) = setup(Arc::new(RecordingResponder::default())).await;
        assert!(p.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn happy_path_reaches_responder_and_records_reply() {
        let responder = Arc::new(RecordingResponder::default());
        let (db, p) = setup(responder.clone()).await;

        let item = db
            .enqueue(&form(&[
                ("from", "Jane Doe <jane@example.com>"),
                ("subject", "Re: Hello"),
                ("text", "Thanks! See you then.\n\nOn Mon, Jun 1, Jane wrote:\n> original"),
            ]))
            .await
            .unwrap();

        let (id, outcome) = p.process_next().await.unwrap().unwrap();
        assert_eq!(id, item.id);
        assert_eq!(outcome, ItemOutcome::Completed);

        let calls = responder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.sender, "jane@example.com");
        assert_eq!(calls[0].0.subject, "Re: Hello");
        assert_eq!(calls[0].0.body, "Thanks! See you then.");

        let stored = db.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);

        let own_id = calls[0].0.message_id.clone().unwrap();
        let thread = db.find_by_message_id(&own_id).await.unwrap().unwrap();
        let history = db.thread_history(&thread.conversation_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].direction, Direction::Outgoing);
        assert_eq!(history[1].email.body, "Thanks for your note about Re: Hello");
        assert_eq!(history[1].email.in_reply_to.as_deref(), Some(own_id.as_str()));
    }

    #[tokio::test]
    async fn identical_deliveries_reach_responder_once() {
        let responder = Arc::new(RecordingResponder::default());
        let (db, p) = setup(responder.clone()).await;

        let delivery = form(&[("from", "a@x.com"), ("subject", "Dup"), ("text", "Same body")]);
        let first = db.enqueue(&delivery).await.unwrap();
        let second = db.enqueue(&delivery).await.unwrap();

        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Completed);
        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Duplicate);

        assert_eq!(responder.calls.lock().unwrap().len(), 1);
        for id in [first.id, second.id] {
            let item = db.get_item(id).await.unwrap().unwrap();
            assert_eq!(item.status, QueueStatus::Completed);
        }
    }

    #[tokio::test]
    async fn relay_redelivery_with_same_send_time_is_duplicate() {
        let responder = Arc::new(RecordingResponder::default());
        let (db, p) = setup(responder.clone()).await;

        let parts = [
            ("from", "a@x.com"),
            ("subject", "Redelivered"),
            ("timestamp", "1780394400"),
            ("text", "Same body"),
        ];
        let first = form(&parts);
        let mut second = form(&parts);
        second.received_at = first.received_at + chrono::Duration::minutes(5);

        db.enqueue(&first).await.unwrap();
        db.enqueue(&second).await.unwrap();

        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Completed);
        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Duplicate);
        assert_eq!(responder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redelivery_keyed_on_embedded_date_header() {
        let responder = Arc::new(RecordingResponder::default());
        let (db, p) = setup(responder.clone()).await;

        let embedded = "From: a@x.com\nSubject: Dated\nDate: Tue, 2 Jun 2026 10:00:00 +0000\n\nHello from the embedded copy";
        let first = form(&[("email", embedded)]);
        let mut second = form(&[("email", embedded)]);
        second.received_at = first.received_at + chrono::Duration::hours(1);

        db.enqueue(&first).await.unwrap();
        db.enqueue(&second).await.unwrap();

        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Completed);
        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Duplicate);
        assert_eq!(responder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undated_messages_arriving_apart_are_distinct() {
        let responder = Arc::new(RecordingResponder::default());
        let (db, p) = setup(responder.clone()).await;

        let parts = [("from", "a@x.com"), ("subject", "Ping"), ("text", "Are you there?")];
        let first = form(&parts);
        let mut second = form(&parts);
        second.received_at = first.received_at + chrono::Duration::hours(1);

        db.enqueue(&first).await.unwrap();
        db.enqueue(&second).await.unwrap();

        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Completed);
        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Completed);
        assert_eq!(responder.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn always_failing_item_exhausts_retries() {
        let responder = Arc::new(FailingResponder {
            calls: AtomicUsize::new(0),
        });
        let (db, p) = setup(responder.clone()).await;
        let max = p.settings().max_attempts;

        let item = db
            .enqueue(&form(&[("from", "a@x.com"), ("subject", "S"), ("text", "hello")]))
            .await
            .unwrap();

        for attempt in 1..max {
            let (_, outcome) = p.process_next().await.unwrap().unwrap();
            assert!(matches!(outcome, ItemOutcome::Retrying { attempt: a, .. } if a == attempt));
            let stored = db.get_item(item.id).await.unwrap().unwrap();
            assert_eq!(stored.status, QueueStatus::Pending);
            assert_eq!(stored.attempt_count, attempt);
        }

        let (_, outcome) = p.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::Failed { attempt, .. } if attempt == max));

        let stored = db.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.attempt_count, max);
        assert!(stored.last_error.unwrap().contains("503 from upstream"));
        assert_eq!(responder.calls.load(Ordering::SeqCst), max as usize);

        // Terminal: nothing left to pick up
        assert!(p.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_after_transient_failure_does_not_duplicate_thread_records() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let failing = processor(
            db.clone(),
            Arc::new(FailingResponder {
                calls: AtomicUsize::new(0),
            }),
            ProcessorSettings::default(),
        );
        let item = db
            .enqueue(&form(&[("from", "a@x.com"), ("subject", "S"), ("text", "hello")]))
            .await
            .unwrap();
        assert!(matches!(
            failing.process_next().await.unwrap().unwrap().1,
            ItemOutcome::Retrying { .. }
        ));

        let responder = Arc::new(RecordingResponder::default());
        let working = processor(db.clone(), responder.clone(), ProcessorSettings::default());
        assert_eq!(working.process_next().await.unwrap().unwrap().1, ItemOutcome::Completed);

        let own_id = responder.calls.lock().unwrap()[0].0.message_id.clone().unwrap();
        assert_eq!(own_id, format!("generated-{}@inbound.local", item.id));

        let thread = db.find_by_message_id(&own_id).await.unwrap().unwrap();
        let history = db.thread_history(&thread.conversation_id).await.unwrap();
        let incoming = history.iter().filter(|r| r.direction == Direction::Incoming).count();
        assert_eq!(incoming, 1);
        assert_eq!(history.len(), 2);

        let stored = db.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn unparseable_payload_fails_without_consuming_attempts() {
        let responder = Arc::new(RecordingResponder::default());
        let (db, p) = setup(responder.clone()).await;
        let item = db.enqueue(&RawDelivery::new("", None)).await.unwrap();

        let (_, outcome) = p.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::Failed { attempt: 0, .. }));

        let stored = db.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.attempt_count, 0);
        assert!(responder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_body_accepted_records_thread_without_reply() {
        let responder = Arc::new(RecordingResponder::default());
        let (db, p) = setup(responder.clone()).await;
        let embedded = "From: a@x.com\nMessage-ID: <empty@x>\nContent-Type: text/plain\n\n> only quoted";
        db.enqueue(&form(&[("from", "a@x.com"), ("subject", "S"), ("email", embedded)]))
            .await
            .unwrap();

        assert_eq!(p.process_next().await.unwrap().unwrap().1, ItemOutcome::Completed);
        assert!(responder.calls.lock().unwrap().is_empty());

        let thread = db.find_by_message_id("empty@x").await.unwrap().unwrap();
        assert_eq!(thread.message_ids, vec!["empty@x"]);
    }

    #[tokio::test]
    async fn empty_body_retry_policy_retries() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let settings = ProcessorSettings {
            empty_body_policy: EmptyBodyPolicy::Retry,
            ..ProcessorSettings::default()
        };
        let p = processor(db.clone(), Arc::new(RecordingResponder::default()), settings);
        db.enqueue(&form(&[("from", "a@x.com"), ("subject", "S"), ("text", "> quoted only")]))
            .await
            .unwrap();

        let (_, outcome) = p.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::Retrying { attempt: 1, ref error } if error.contains("No message body")));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_responder_times_out_as_retryable() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let settings = ProcessorSettings {
            responder_timeout: Duration::from_secs(5),
            ..ProcessorSettings::default()
        };
        let p = processor(db.clone(), Arc::new(HangingResponder), settings);
        db.enqueue(&form(&[("from", "a@x.com"), ("subject", "S"), ("text", "hello")]))
            .await
            .unwrap();

        let (_, outcome) = p.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::Retrying { ref error, .. } if error.contains("timed out")));
    }

    #[tokio::test]
    async fn reply_threads_and_sees_history() {
        let responder = Arc::new(RecordingResponder::default());
        let (db, p) = setup(responder.clone()).await;

        let a = "From: a@x.com\nMessage-ID: <a@example.com>\nContent-Type: text/plain\n\nFirst message";
        let b = "From: a@x.com\nMessage-ID: <b@example.com>\nIn-Reply-To: <a@example.com>\nContent-Type: text/plain\n\nSecond message";
        db.enqueue(&form(&[("subject", "Plan"), ("email", a)])).await.unwrap();
        db.enqueue(&form(&[("subject", "Re: Plan"), ("email", b)])).await.unwrap();

        p.process_next().await.unwrap();
        p.process_next().await.unwrap();

        let thread = db.find_by_message_id("b@example.com").await.unwrap().unwrap();
        assert_eq!(thread.message_ids, vec!["a@example.com", "b@example.com"]);

        let calls = responder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        let history = &calls[1].1;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "First message");
        assert_eq!(history[1].sender, REPLY_SENDER);
    }

    #[tokio::test]
    async fn recover_stale_uses_threshold() {
        let (db, p) = setup(Arc::new(RecordingResponder::default())).await;
        let item = db.enqueue(&form(&[("from", "a@x.com"), ("text", "x y z w")])).await.unwrap();
        db.mark_processing(item.id).await.unwrap();

        assert!(p.recover_stale(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::from_std(p.settings().stale_processing_after).unwrap()
            + chrono::Duration::seconds(1);
        let reset = p.recover_stale(later).await.unwrap();
        assert_eq!(reset.requeued, 1);
        assert_eq!(db.get_item(item.id).await.unwrap().unwrap().status, QueueStatus::Pending);
    }
}
