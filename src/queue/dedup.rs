//! Deduplication gate: one physical delivery is processed at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// Fingerprint of one logical message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// SHA-256 over arrival time, sender, subject and message id.
    pub fn new(
        received_at: DateTime<Utc>,
        sender: &str,
        subject: &str,
        message_id: Option<&str>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(received_at.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
        // Unit separators keep ("ab","c") and ("a","bc") apart
        for part in [sender, subject, message_id.unwrap_or("")] {
            hasher.update([0x1f]);
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remembers which keys were already handled.
pub trait DedupGate: Send + Sync {
    /// `false` when the key was marked processed and has not expired.
    fn should_process(&self, key: &DedupKey) -> bool;

    fn mark_processed(&self, key: DedupKey);
}

/// In-memory gate bounded by entry count and age.
///
/// The least recently seen key is evicted first once `capacity` is exceeded;
/// entries older than `ttl` are ignored and dropped lazily.
pub struct LruDedupGate {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    /// Key → (sequence of its latest sighting, when that was).
    seen: HashMap<DedupKey, (u64, Instant)>,
    /// Recency order; entries whose sequence no longer matches `seen` are stale.
    order: VecDeque<(DedupKey, u64)>,
    next_seq: u64,
}

impl LruDedupGate {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(GateState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(state: &mut GateState, key: DedupKey, now: Instant) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.seen.insert(key.clone(), (seq, now));
        state.order.push_back((key, seq));
    }

    fn evict(&self, state: &mut GateState, now: Instant) {
        while let Some((key, seq)) = state.order.front() {
            let evict = match state.seen.get(key) {
                Some((current, stamp)) if current == seq => {
                    now.duration_since(*stamp) >= self.ttl || state.seen.len() > self.capacity
                }
                _ => true,
            };
            if !evict {
                break;
            }
            if let Some((key, seq)) = state.order.pop_front()
                && state.seen.get(&key).is_some_and(|(current, _)| *current == seq)
            {
                state.seen.remove(&key);
            }
        }
    }
}

impl DedupGate for LruDedupGate {
    fn should_process(&self, key: &DedupKey) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        self.evict(&mut state, now);

        if state.seen.contains_key(key) {
            Self::touch(&mut state, key.clone(), now);
            debug!(dedup_key = %key, "Duplicate delivery");
            return false;
        }
        true
    }

    fn mark_processed(&self, key: DedupKey) {
        let now = Instant::now();
        let mut state = self.lock();
        Self::touch(&mut state, key, now);
        self.evict(&mut state, now);
    }
}
