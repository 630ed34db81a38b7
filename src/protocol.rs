//! Wire events and the message record shared by every relay path.
//!
//! ## Wire contract
//! - Events travel as JSON text frames tagged `{"event": ..., "data": ...}`
//!   with camelCase field names.
//! - A single [`MessageRecord`] shape backs chat messages, mailbox copies,
//!   presence announcements, and warnings; the `kind` field tells them apart.
//! - Records are immutable after construction except for the kind relabeling
//!   `PM` → `OFFLINE_PM` (when queued for an absent target) and
//!   `PM`/`OFFLINE_PM` → `OLD_PM` (when replayed from a mailbox). The
//!   timestamp is assigned once, at creation, and never recomputed for a
//!   relabeled copy.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Millisecond wall-clock timestamp assigned by the server.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Discriminates what a [`MessageRecord`] means to the receiving client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// All-user chat message.
    Broadcast,
    /// Direct message delivered live.
    Pm,
    /// Echo copy of a sent direct message, kept in the sender's own mailbox.
    #[serde(rename = "SELF")]
    SelfCopy,
    /// Notice to a sender that the target is currently absent.
    Offline,
    /// A `PM` that was queued because its target was absent.
    OfflinePm,
    /// A previously queued direct message, relabeled on replay.
    OldPm,
    /// Abuse or validation notice.
    Warn,
    /// Presence: a user joined.
    New,
    /// Presence: a user left.
    Leave,
}

/// The value type flowing through mailboxes, the broadcast history, and the
/// wire. Fields not meaningful for a given kind are omitted from the JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MessageRecord {
    fn stamped(timestamp: u64, msg: String, user_id: String, user_name: String, kind: MessageKind) -> Self {
        Self {
            timestamp: Some(timestamp),
            msg: Some(msg),
            user_id: Some(user_id),
            user_name: Some(user_name),
            kind,
            reason: None,
        }
    }

    /// All-user chat message.
    pub fn broadcast(timestamp: u64, msg: String, user_id: String, user_name: String) -> Self {
        Self::stamped(timestamp, msg, user_id, user_name, MessageKind::Broadcast)
    }

    /// Direct message, carrying the sender's identity.
    pub fn direct(timestamp: u64, msg: String, sender_id: String, sender_name: String) -> Self {
        Self::stamped(timestamp, msg, sender_id, sender_name, MessageKind::Pm)
    }

    /// Echo copy for the sender's own mailbox. Carries the *target's*
    /// identity so a replay reads as "message you sent to X".
    pub fn own_copy(timestamp: u64, msg: String, target_id: String, target_name: String) -> Self {
        Self::stamped(timestamp, msg, target_id, target_name, MessageKind::SelfCopy)
    }

    /// Ephemeral notice to a sender that the target is absent. Never stored.
    pub fn offline_notice(target_id: String, target_name: String) -> Self {
        Self {
            timestamp: None,
            msg: None,
            user_id: Some(target_id),
            user_name: Some(target_name),
            kind: MessageKind::Offline,
            reason: None,
        }
    }

    /// Abuse or validation notice. Delivered to the offender only, never stored.
    pub fn warn(text: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            msg: Some(text.into()),
            user_id: None,
            user_name: None,
            kind: MessageKind::Warn,
            reason: None,
        }
    }

    /// Presence announcement for a newly identified user.
    pub fn joined(user_id: String, user_name: String) -> Self {
        Self {
            timestamp: None,
            msg: None,
            user_id: Some(user_id),
            user_name: Some(user_name),
            kind: MessageKind::New,
            reason: None,
        }
    }

    /// Presence announcement for a departed user.
    pub fn left(user_id: String, user_name: String, reason: String) -> Self {
        Self {
            timestamp: None,
            msg: None,
            user_id: Some(user_id),
            user_name: Some(user_name),
            kind: MessageKind::Leave,
            reason: Some(reason),
        }
    }

    /// Relabel a `PM` queued for an absent target. Applied once, at enqueue.
    pub fn mark_queued_offline(&mut self) {
        if self.kind == MessageKind::Pm {
            self.kind = MessageKind::OfflinePm;
        }
    }

    /// Relabel a stored direct message on mailbox replay so clients can tell
    /// replay from live delivery. `SELF` copies keep their kind.
    pub fn mark_replayed(&mut self) {
        if matches!(self.kind, MessageKind::Pm | MessageKind::OfflinePm) {
            self.kind = MessageKind::OldPm;
        }
    }
}

// ---------------------------------------------------------------------------
// Client → relay
// ---------------------------------------------------------------------------

/// Events a client may send over an established connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "createUser")]
    CreateUser(Identify),
    #[serde(rename = "gm")]
    Gm(BroadcastSend),
    #[serde(rename = "pm")]
    Pm(DirectSend),
}

/// Claim an identity. The id is opaque and unverified; it keys presence and
/// the mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub user_id: String,
    pub user_name: String,
}

/// Broadcast send request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSend {
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub request_time: Option<u64>,
}

/// Direct send request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectSend {
    pub user_id: String,
    pub user_name: String,
    pub target_id: String,
    pub target_name: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub request_time: Option<u64>,
}

// ---------------------------------------------------------------------------
// Relay → client
// ---------------------------------------------------------------------------

/// Events the relay pushes to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected(ConnectedSnapshot),
    #[serde(rename = "broadcast")]
    Broadcast(MessageRecord),
    #[serde(rename = "pm")]
    Pm(MessageRecord),
    #[serde(rename = "timestamp")]
    Timestamp(TimestampAck),
}

/// First-handshake payload: who is online and every broadcast so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedSnapshot {
    pub users: Vec<(String, String)>,
    pub broadcasts: Vec<MessageRecord>,
}

/// Send acknowledgment correlating the client-submitted request time with
/// the server-assigned record timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_time: Option<u64>,
    pub response_time: u64,
}
