//! Live mapping from user identifier to active connection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::guard::{Guard, Rejection, SpeakState};
use crate::protocol::ServerEvent;

/// One registered connection: display name, outbound channel, and the speak
/// state the rate guard consults.
struct Connection {
    user_name: String,
    tx: UnboundedSender<ServerEvent>,
    speak: SpeakState,
}

/// Connection registry. An entry exists only while its user has an active,
/// identified connection. Registering an already-present identifier silently
/// overwrites the previous connection (last register wins). Lookup and send
/// happen under one lock so a presence check cannot race an unregister.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<BTreeMap<String, Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: &str, user_name: &str, tx: UnboundedSender<ServerEvent>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.insert(
            user_id.to_string(),
            Connection {
                user_name: user_name.to_string(),
                tx,
                speak: SpeakState::default(),
            },
        );
    }

    /// Remove the entry. No-op (returning false) when absent.
    pub fn unregister(&self, user_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.remove(user_id).is_some()
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.contains_key(user_id)
    }

    /// Ordered `(userId, userName)` pairs for every registered connection.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .iter()
            .map(|(user_id, connection)| (user_id.clone(), connection.user_name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to one user. Returns whether the user was registered; the send
    /// itself is fire-and-forget.
    pub fn send_to(&self, user_id: &str, event: ServerEvent) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        match inner.get(user_id) {
            Some(connection) => {
                let _ = connection.tx.send(event);
                true
            }
            None => false,
        }
    }

    /// Deliver to every registered connection except `excluded_id`. Returns
    /// the number of recipients.
    pub fn broadcast_except(&self, excluded_id: &str, event: &ServerEvent) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut delivered = 0;
        for (user_id, connection) in inner.iter() {
            if user_id != excluded_id {
                let _ = connection.tx.send(event.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Run the rate guard against `user_id`'s speak state. `None` when the
    /// user is not registered.
    pub fn admit_broadcast(&self, user_id: &str, guard: &Guard) -> Option<Result<(), Rejection>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .get_mut(user_id)
            .map(|connection| guard.admit_rate(&mut connection.speak))
    }
}
