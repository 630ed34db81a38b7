//! Per-user queues of direct messages awaiting the owner's next connect.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::protocol::MessageRecord;

/// Offline mailbox store. Queues preserve insertion order and survive replay:
/// delivered records stay in the store and come back relabeled `OLD_PM` on
/// every later connect. Growth is unbounded unless a cap is configured, in
/// which case the oldest records are evicted first.
#[derive(Clone)]
pub struct Mailbox {
    queues: Arc<Mutex<HashMap<String, VecDeque<MessageRecord>>>>,
    cap: Option<usize>,
}

impl Mailbox {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            cap,
        }
    }

    /// Append a record to `user_id`'s queue, creating the queue if absent.
    pub fn enqueue(&self, user_id: &str, record: MessageRecord) {
        let mut queues = self.queues.lock().expect("mailbox lock poisoned");
        let queue = queues.entry(user_id.to_string()).or_default();
        if let Some(cap) = self.cap {
            while queue.len() >= cap {
                queue.pop_front();
            }
        }
        queue.push_back(record);
    }

    /// Return the full queue for `user_id` in insertion order, relabeling
    /// each stored `PM`/`OFFLINE_PM` to `OLD_PM` in place. The queue is not
    /// cleared; records remain for future replays.
    pub fn replay(&self, user_id: &str) -> Vec<MessageRecord> {
        let mut queues = self.queues.lock().expect("mailbox lock poisoned");
        match queues.get_mut(user_id) {
            Some(queue) => queue
                .iter_mut()
                .map(|record| {
                    record.mark_replayed();
                    record.clone()
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Current depth of `user_id`'s queue.
    pub fn depth(&self, user_id: &str) -> usize {
        let queues = self.queues.lock().expect("mailbox lock poisoned");
        queues.get(user_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Depths of every queue, sorted by user id.
    pub fn depths(&self) -> Vec<(String, usize)> {
        let queues = self.queues.lock().expect("mailbox lock poisoned");
        let mut depths: Vec<(String, usize)> = queues
            .iter()
            .map(|(user_id, queue)| (user_id.clone(), queue.len()))
            .collect();
        depths.sort();
        depths
    }
}
