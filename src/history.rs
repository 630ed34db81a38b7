//! Append-only log of every broadcast, replayed to new connections.

use std::sync::{Arc, Mutex};

use crate::protocol::MessageRecord;

/// Process-wide broadcast log. No capacity bound and no eviction: every
/// broadcast ever accepted is retained for the life of the process.
#[derive(Clone, Default)]
pub struct BroadcastHistory {
    log: Arc<Mutex<Vec<MessageRecord>>>,
}

impl BroadcastHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: MessageRecord) {
        self.log.lock().expect("history lock poisoned").push(record);
    }

    /// Full ordered log, for replay to a newly connecting client.
    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.log.lock().expect("history lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
