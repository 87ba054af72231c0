//! Idempotency guard for inbound messages and chunks.
//!
//! The server may deliver the same event more than once, most often around
//! a reconnect. Every apply path asks this registry first; the check and
//! the recording are one operation, so two rapid duplicates cannot both
//! pass. The window is bounded and evicts oldest-first: this is a cache,
//! not a log, and an evicted entry means the id is old enough that the
//! stream registry's sequence tracking catches any straggler.

use std::collections::{HashSet, VecDeque};

/// Default number of recently seen keys to retain.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Bounded registry of recently applied message and chunk identifiers.
#[derive(Debug)]
pub struct Deduplicator {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// True if `message_id` was already tracked. Tracks it otherwise.
    pub fn check_and_track(&mut self, message_id: &str) -> bool {
        self.check_and_track_key(message_key(message_id))
    }

    /// Same contract for one chunk of a streamed response.
    pub fn check_and_track_chunk(&mut self, response_id: &str, seq: u64) -> bool {
        self.check_and_track_key(chunk_key(response_id, seq))
    }

    /// Read-only membership probe, no tracking side effect.
    pub fn has_message(&self, message_id: &str) -> bool {
        self.seen.contains(&message_key(message_id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn check_and_track_key(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        false
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

// Keys are namespaced so a message id can never collide with a chunk pair.
fn message_key(message_id: &str) -> String {
    format!("m:{message_id}")
}

fn chunk_key(response_id: &str, seq: u64) -> String {
    format!("c:{response_id}:{seq}")
}
