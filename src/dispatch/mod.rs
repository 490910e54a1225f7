pub mod recovery;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Backpressure valve: at most this many references wait per buffer.
pub const DEFAULT_TOPIC_CAPACITY: usize = 500;

/// In-memory reference to a stored job. Never carries the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    pub topic: String,
    pub id: u64,
}

impl Msg {
    pub fn new(topic: impl Into<String>, id: u64) -> Self {
        Self {
            topic: topic.into(),
            id,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    Closed,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "dispatch registry is closed"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct TopicStats {
    pub topic: String,
    pub pending: usize,
    pub requeued: usize,
    pub published_total: u64,
    pub requeued_total: u64,
    pub delivered_total: u64,
    pub dispatched_total: u64,
    pub first_dispatch_at: Option<DateTime<Utc>>,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub last_ok_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TopicBuffers {
    pending: VecDeque<u64>,
    requeue: VecDeque<u64>,
    published_total: u64,
    requeued_total: u64,
    delivered_total: u64,
    dispatched_total: u64,
    first_dispatch_at: Option<DateTime<Utc>>,
    last_dispatch_at: Option<DateTime<Utc>>,
    last_ok_at: Option<DateTime<Utc>>,
}

impl TopicBuffers {
    fn stats(&self, topic: &str) -> TopicStats {
        TopicStats {
            topic: topic.to_owned(),
            pending: self.pending.len(),
            requeued: self.requeue.len(),
            published_total: self.published_total,
            requeued_total: self.requeued_total,
            delivered_total: self.delivered_total,
            dispatched_total: self.dispatched_total,
            first_dispatch_at: self.first_dispatch_at,
            last_dispatch_at: self.last_dispatch_at,
            last_ok_at: self.last_ok_at,
        }
    }

    fn record_dispatch(&mut self) {
        let now = Utc::now();
        self.dispatched_total += 1;
        self.first_dispatch_at.get_or_insert(now);
        self.last_dispatch_at = Some(now);
    }
}

#[derive(Default)]
struct RegistryState {
    topics: HashMap<String, TopicBuffers>,
    closed: bool,
}

impl RegistryState {
    fn topic_mut(&mut self, topic: &str) -> &mut TopicBuffers {
        self.topics.entry(topic.to_owned()).or_default()
    }

    fn pop_preferring_requeue(&mut self, topics: &[String]) -> Option<Msg> {
        for buffer in [Buffer::Requeue, Buffer::Pending] {
            for topic in topics {
                let Some(buffers) = self.topics.get_mut(topic) else {
                    continue;
                };
                let popped = match buffer {
                    Buffer::Pending => buffers.pending.pop_front(),
                    Buffer::Requeue => buffers.requeue.pop_front(),
                };
                if let Some(id) = popped {
                    buffers.record_dispatch();
                    return Some(Msg::new(topic.as_str(), id));
                }
            }
        }

        None
    }
}

#[derive(Clone, Copy)]
enum Buffer {
    Pending,
    Requeue,
}

/// Hands job references from ingestion and recovery to worker sessions.
///
/// Every topic owns a bounded *pending* buffer (fresh jobs) and a bounded
/// *requeue* buffer (jobs whose delivery failed). Both buffers of every topic
/// live behind one mutex: `take` removes a reference while holding it, so no
/// two sessions ever observe the same buffered reference.
pub struct DispatchRegistry {
    capacity: usize,
    state: Mutex<RegistryState>,
    available: Condvar,
    space: Condvar,
}

impl DispatchRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(RegistryState::default()),
            available: Condvar::new(),
            space: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("dispatch registry lock poisoned")
    }

    /// Creates the buffer pair for `topic` if it does not exist yet.
    pub fn ensure_topic(&self, topic: &str) {
        self.lock().topic_mut(topic);
    }

    /// Appends to the pending buffer, blocking while it is full.
    pub fn publish(&self, msg: Msg) -> Result<(), RegistryError> {
        self.push(msg, Buffer::Pending)
    }

    /// Appends to the requeue buffer, blocking while it is full.
    pub fn requeue(&self, msg: Msg) -> Result<(), RegistryError> {
        self.push(msg, Buffer::Requeue)
    }

    fn push(&self, msg: Msg, buffer: Buffer) -> Result<(), RegistryError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(RegistryError::Closed);
            }

            let capacity = self.capacity;
            let buffers = state.topic_mut(&msg.topic);
            let queue = match buffer {
                Buffer::Pending => &mut buffers.pending,
                Buffer::Requeue => &mut buffers.requeue,
            };
            if queue.len() < capacity {
                queue.push_back(msg.id);
                match buffer {
                    Buffer::Pending => buffers.published_total += 1,
                    Buffer::Requeue => buffers.requeued_total += 1,
                }
                break;
            }

            state = self
                .space
                .wait(state)
                .expect("dispatch registry lock poisoned");
        }
        drop(state);

        self.available.notify_all();
        Ok(())
    }

    #[cfg(test)]
    pub fn take(&self, topic: &str) -> Result<Msg, RegistryError> {
        self.take_any(&[topic.to_owned()])
    }

    /// Blocks until any of `topics` has a buffered reference. Requeue buffers
    /// of all listed topics are drained before any pending buffer.
    pub fn take_any(&self, topics: &[String]) -> Result<Msg, RegistryError> {
        let mut state = self.lock();
        for topic in topics {
            state.topic_mut(topic);
        }

        loop {
            if state.closed {
                return Err(RegistryError::Closed);
            }

            if let Some(msg) = state.pop_preferring_requeue(topics) {
                drop(state);
                self.space.notify_all();
                return Ok(msg);
            }

            state = self
                .available
                .wait(state)
                .expect("dispatch registry lock poisoned");
        }
    }

    /// Records a worker's completion acknowledgment for statistics.
    pub fn acknowledge(&self, msg: &Msg) {
        let mut state = self.lock();
        let buffers = state.topic_mut(&msg.topic);
        buffers.delivered_total += 1;
        buffers.last_ok_at = Some(Utc::now());
    }

    /// Wakes every blocked caller; subsequent operations fail with
    /// [`RegistryError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
        self.space.notify_all();
    }

    #[cfg(test)]
    pub fn stats(&self, topic: &str) -> Option<TopicStats> {
        self.lock()
            .topics
            .get(topic)
            .map(|buffers| buffers.stats(topic))
    }

    pub fn snapshot(&self) -> Vec<TopicStats> {
        let state = self.lock();
        let mut stats: Vec<TopicStats> = state
            .topics
            .iter()
            .map(|(topic, buffers)| buffers.stats(topic))
            .collect();
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        stats
    }
}
