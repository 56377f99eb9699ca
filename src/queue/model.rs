//! Queue item model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ingest::RawDelivery;

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for the poller.
    Pending,
    /// Claimed by the poller; extraction in progress.
    Processing,
    /// Fully handled (or acknowledged as a duplicate).
    Completed,
    /// Gave up; retained for audit.
    Failed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: QueueStatus) -> bool {
        use QueueStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
        )
    }

    /// States from which `target` is reachable.
    pub fn sources(target: QueueStatus) -> Vec<QueueStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }

    /// Terminal states are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// One webhook delivery waiting for, or done with, processing.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Uuid,
    pub payload: RawDelivery,
    pub status: QueueStatus,
    /// Failed attempts so far. Only ever increases.
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueueItem {
    /// A fresh pending item for a delivery.
    pub fn new(payload: RawDelivery) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            status: QueueStatus::Pending,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn add(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Processing => self.processing += count,
            QueueStatus::Completed => self.completed += count,
            QueueStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Outcome of a stale-processing sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleReset {
    /// Moved back to `pending`.
    pub requeued: u64,
    /// Out of attempts; moved to `failed`.
    pub failed: u64,
}

impl StaleReset {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}
