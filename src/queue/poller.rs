//! Fixed-interval scheduler that drives the [`QueueProcessor`].
//!
//! Each tick recovers stale `processing` items and then settles at most one
//! pending item. Staleness is judged against an injectable [`Clock`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::processor::{ItemOutcome, QueueProcessor};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct Poller {
    processor: Arc<QueueProcessor>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Poller {
    pub fn new(processor: Arc<QueueProcessor>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            processor,
            clock,
            // tokio::time::interval panics on a zero period
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// One scheduler step. Errors are logged, never propagated.
    pub async fn tick(&self) -> Option<(Uuid, ItemOutcome)> {
        match self.processor.recover_stale(self.clock.now()).await {
            Ok(reset) if !reset.is_empty() => {
                warn!(
                    requeued = reset.requeued,
                    failed = reset.failed,
                    "Recovered stale processing items"
                );
            }
            Ok(_) => {}
            Err(e) => error!("Stale recovery failed: {e}"),
        }

        match self.processor.process_next().await {
            Ok(settled) => settled,
            Err(e) => {
                error!("Queue processing failed: {e}");
                None
            }
        }
    }

    /// Spawn the loop. The first tick fires immediately, so stale items
    /// left by a previous run are recovered on start.
    pub fn start(self) -> PollerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!("Queue poller started, ticking every {:?}", self.interval);

            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    info!("Queue poller shutting down");
                    return;
                }

                self.tick().await;
            }
        });

        PollerHandle {
            handle,
            shutdown: shutdown_flag,
        }
    }
}

/// Running poller; dropping it leaves the task running.
pub struct PollerHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl PollerHandle {
    /// Ask the loop to exit at its next tick and wait for it.
    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            error!("Queue poller panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::dedup::LruDedupGate;
    use crate::queue::model::QueueStatus;
    use crate::queue::processor::ProcessorSettings;
    use crate::queue::processor::tests::{RecordingResponder, form};
    use crate::store::{LibSqlBackend, QueueStore};

    async fn poller_with(
        clock: Arc<dyn Clock>,
    ) -> (Arc<LibSqlBackend>, Arc<RecordingResponder>, Poller) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let responder = Arc::new(RecordingResponder::default());
        let processor = QueueProcessor::new(
            db.clone(),
            db.clone(),
            responder.clone(),
            Arc::new(LruDedupGate::new(100, Duration::from_secs(3600))),
            ProcessorSettings::default(),
        );
        let poller = Poller::new(Arc::new(processor), clock, Duration::from_secs(10));
        (db, responder, poller)
    }

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn tick_processes_one_item() {
        let (db, responder, poller) = poller_with(Arc::new(SystemClock)).await;
        for subject in ["one", "two"] {
            db.enqueue(&form(&[("from", "a@x.com"), ("subject", subject), ("text", "hello there")]))
                .await
                .unwrap();
        }

        assert!(matches!(poller.tick().await, Some((_, ItemOutcome::Completed))));
        assert_eq!(responder.calls.lock().unwrap().len(), 1);
        assert_eq!(db.queue_stats().await.unwrap().pending, 1);

        assert!(poller.tick().await.is_some());
        assert!(poller.tick().await.is_none());
    }

    #[tokio::test]
    async fn tick_requeues_items_stale_by_injected_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (db, responder, poller) = poller_with(clock.clone()).await;

        let item = db
            .enqueue(&form(&[("from", "a@x.com"), ("subject", "S"), ("text", "hello there")]))
            .await
            .unwrap();
        db.mark_processing(item.id).await.unwrap();

        // Not stale yet: nothing pending to pick up
        assert!(poller.tick().await.is_none());
        assert_eq!(
            db.get_item(item.id).await.unwrap().unwrap().status,
            QueueStatus::Processing
        );

        clock.advance(Duration::from_secs(3600));
        let (id, outcome) = poller.tick().await.unwrap();
        assert_eq!(id, item.id);
        assert_eq!(outcome, ItemOutcome::Completed);
        assert_eq!(responder.calls.lock().unwrap().len(), 1);

        let stored = db.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn started_loop_drains_queue_on_interval() {
        let (db, responder, poller) = poller_with(Arc::new(SystemClock)).await;
        for subject in ["one", "two", "three"] {
            db.enqueue(&form(&[("from", "a@x.com"), ("subject", subject), ("text", "hello there")]))
                .await
                .unwrap();
        }

        let handle = poller.start();

        // First tick is immediate; the rest follow every 10s
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        assert_eq!(responder.calls.lock().unwrap().len(), 3);
        assert_eq!(db.queue_stats().await.unwrap().completed, 3);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_loop_processes_nothing_more() {
        let (db, responder, poller) = poller_with(Arc::new(SystemClock)).await;
        let handle = poller.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.stop().await;

        db.enqueue(&form(&[("from", "a@x.com"), ("subject", "late"), ("text", "hello there")]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(responder.calls.lock().unwrap().is_empty());
        assert_eq!(db.queue_stats().await.unwrap().pending, 1);
    }
}
