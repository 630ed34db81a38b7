//! Size and rate checks applied before a message is accepted.

use std::time::{Duration, Instant};

/// Why the guard refused a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Oversize,
    Throttled,
}

impl Rejection {
    /// Text carried by the `WARN` record sent back to the offender.
    pub fn warning(self) -> &'static str {
        match self {
            Rejection::Oversize => "message exceeds the size limit",
            Rejection::Throttled => "sending too fast, slow down",
        }
    }
}

/// Per-connection speaking state, owned by the registry entry.
#[derive(Debug, Default)]
pub struct SpeakState {
    last_speak: Option<Instant>,
    pub messages_sent: u64,
}

/// Stateless admission policy. The mutable state it consults lives on the
/// sending connection's [`SpeakState`].
#[derive(Debug, Clone, Copy)]
pub struct Guard {
    max_message_bytes: usize,
    min_speak_interval: Duration,
}

impl Guard {
    pub fn new(max_message_bytes: usize, min_speak_interval: Duration) -> Self {
        Self {
            max_message_bytes,
            min_speak_interval,
        }
    }

    /// Reject bodies whose UTF-8 encoding reaches the byte limit. Counts
    /// encoded bytes, not characters.
    pub fn admit_size(&self, msg: &str) -> Result<(), Rejection> {
        if msg.len() >= self.max_message_bytes {
            Err(Rejection::Oversize)
        } else {
            Ok(())
        }
    }

    /// Reject a broadcast attempted within the minimum interval since the
    /// connection's previous attempt. The last-speak timestamp and message
    /// counter update whether the attempt is admitted or not.
    pub fn admit_rate(&self, speak: &mut SpeakState) -> Result<(), Rejection> {
        let now = Instant::now();
        let throttled = speak
            .last_speak
            .is_some_and(|last| now.duration_since(last) < self.min_speak_interval);
        speak.messages_sent += 1;
        speak.last_speak = Some(now);
        if throttled {
            Err(Rejection::Throttled)
        } else {
            Ok(())
        }
    }
}
