//! In-memory message lanes feeding the network pipelines.
//!
//! One FIFO per [`MessageType`]. Producers push from any thread; each lane
//! has at most one blocking consumer (the matching request loop, or the
//! command processor), so a single stored-permit wakeup per lane suffices.
//!
//! Reads and removals are split: `get_next` / `get_next_n` peek without
//! removing, and `pop_n` removes after the consumer has confirmed delivery.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use palisade_types::{Message, MessageType};

struct Lane {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

/// Thread-safe collection of per-type FIFO lanes.
pub struct MessageQueue {
    stateful: Lane,
    stateless: Lane,
    command: Lane,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            stateful: Lane::new(),
            stateless: Lane::new(),
            command: Lane::new(),
        }
    }

    fn lane(&self, kind: MessageType) -> &Lane {
        match kind {
            MessageType::Stateful => &self.stateful,
            MessageType::Stateless => &self.stateless,
            MessageType::Command => &self.command,
        }
    }

    /// Enqueue one message on its lane. Returns the number accepted (1).
    pub fn push(&self, message: Message) -> usize {
        let lane = self.lane(message.kind);
        lane.queue
            .lock()
            .expect("lane mutex poisoned")
            .push_back(message);
        lane.notify.notify_one();
        1
    }

    /// Enqueue a batch; messages land on their own lanes in order.
    /// Returns the number accepted.
    pub fn push_batch(&self, messages: Vec<Message>) -> usize {
        let mut accepted = 0;
        for message in messages {
            accepted += self.push(message);
        }
        accepted
    }

    /// Whether the lane has no messages.
    pub fn is_empty(&self, kind: MessageType) -> bool {
        self.lane(kind)
            .queue
            .lock()
            .expect("lane mutex poisoned")
            .is_empty()
    }

    /// Number of messages currently on the lane.
    pub fn len(&self, kind: MessageType) -> usize {
        self.lane(kind)
            .queue
            .lock()
            .expect("lane mutex poisoned")
            .len()
    }

    /// Peek the oldest message on the lane without removing it.
    pub fn get_next(&self, kind: MessageType) -> Option<Message> {
        self.lane(kind)
            .queue
            .lock()
            .expect("lane mutex poisoned")
            .front()
            .cloned()
    }

    /// Cooperatively wait until at least one message is available, then
    /// return up to `n` oldest messages without removing them.
    ///
    /// Callers race this against their shutdown signal; the future holds no
    /// lock while suspended.
    pub async fn get_next_n(&self, kind: MessageType, n: usize) -> Vec<Message> {
        let lane = self.lane(kind);
        loop {
            {
                let queue = lane.queue.lock().expect("lane mutex poisoned");
                if !queue.is_empty() {
                    return queue.iter().take(n).cloned().collect();
                }
            }
            lane.notify.notified().await;
        }
    }

    /// Remove up to `n` oldest messages. Returns the number removed.
    pub fn pop_n(&self, kind: MessageType, n: usize) -> usize {
        let mut queue = self.lane(kind).queue.lock().expect("lane mutex poisoned");
        let count = n.min(queue.len());
        queue.drain(..count);
        count
    }
}
