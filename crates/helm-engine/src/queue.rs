use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Which lane a queued message targets.
///
/// Steering messages interrupt the in-flight turn; follow-ups wait until the
/// current run finishes. Steering always drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Steering,
    FollowUp,
}

/// How many queued messages to deliver at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Drain the whole lane into one delivery.
    #[default]
    All,
    /// Deliver one message per loop iteration.
    OneAtATime,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Global arrival order across both lanes.
    pub seq: u64,
    pub lane: Lane,
    pub text: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueInner {
    steering: VecDeque<QueuedMessage>,
    follow_up: VecDeque<QueuedMessage>,
    next_seq: u64,
}

/// User input that arrived while the loop is running.
///
/// The loop polls at safe boundaries: between stream events for steering,
/// between runs for follow-ups. Pushing never blocks the loop.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, lane: Lane, text: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let msg = QueuedMessage {
            seq: inner.next_seq,
            lane,
            text: text.into(),
            queued_at: Utc::now(),
        };
        let seq = msg.seq;
        match lane {
            Lane::Steering => inner.steering.push_back(msg),
            Lane::FollowUp => inner.follow_up.push_back(msg),
        }
        seq
    }

    pub fn has_steering(&self) -> bool {
        !self.inner.lock().steering.is_empty()
    }

    pub fn has_follow_up(&self) -> bool {
        !self.inner.lock().follow_up.is_empty()
    }

    /// Take steering messages for delivery, in arrival order.
    pub fn take_steering(&self, mode: QueueMode) -> Vec<QueuedMessage> {
        let mut inner = self.inner.lock();
        match mode {
            QueueMode::All => inner.steering.drain(..).collect(),
            QueueMode::OneAtATime => inner.steering.pop_front().into_iter().collect(),
        }
    }

    /// Take follow-up messages. Empty while steering is pending: steering
    /// pre-empts follow-ups.
    pub fn take_follow_up(&self, mode: QueueMode) -> Vec<QueuedMessage> {
        let mut inner = self.inner.lock();
        if !inner.steering.is_empty() {
            return Vec::new();
        }
        match mode {
            QueueMode::All => inner.follow_up.drain(..).collect(),
            QueueMode::OneAtATime => inner.follow_up.pop_front().into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.steering.is_empty() && inner.follow_up.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.steering.clear();
        inner.follow_up.clear();
    }
}
