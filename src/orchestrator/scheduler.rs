//! Admission queue.
//!
//! Queued sessions are admitted highest priority first and in submission
//! order within a priority. The queue itself knows nothing about capacity;
//! the coordinator pops from it only while a slot is free, so a running
//! session is never preempted.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::models::session::SessionId;

type QueueKey = (Reverse<i32>, u64);

/// Priority-then-FIFO ordering of queued sessions.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    order: BTreeMap<QueueKey, SessionId>,
    index: HashMap<SessionId, QueueKey>,
    next_seq: u64,
}

impl AdmissionQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `session_id` with `priority`. Re-enqueueing an already queued
    /// session is a no-op.
    pub fn push(&mut self, session_id: SessionId, priority: i32) {
        if self.index.contains_key(&session_id) {
            return;
        }
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.order.insert(key, session_id.clone());
        self.index.insert(session_id, key);
    }

    /// Take the next session to admit.
    pub fn pop(&mut self) -> Option<SessionId> {
        let (_, session_id) = self.order.pop_first()?;
        self.index.remove(&session_id);
        Some(session_id)
    }

    /// Next session without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&SessionId> {
        self.order.values().next()
    }

    /// Remove `session_id`. Returns whether it was queued.
    pub fn remove(&mut self, session_id: &str) -> bool {
        match self.index.remove(session_id) {
            Some(key) => {
                self.order.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Whether `session_id` is queued.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.index.contains_key(session_id)
    }

    /// 0-based position of `session_id` in admission order.
    #[must_use]
    pub fn position(&self, session_id: &str) -> Option<usize> {
        let key = self.index.get(session_id)?;
        Some(self.order.range(..key).count())
    }

    /// Number of queued sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
