//! Configuration types and constants for the relay.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

pub(crate) const DEFAULT_BIND: &str = "127.0.0.1:29231";
pub(crate) const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024;
pub(crate) const DEFAULT_MIN_SPEAK_INTERVAL_SECS: u64 = 3;

/// Longest accepted direct-message target identifier, in characters.
pub const MAX_TARGET_ID_CHARS: usize = 12;

/// Presence-aware chat relay.
///
/// Tracks who is online, routes broadcast and direct messages, and holds
/// messages for offline users until they next connect.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "palaver-relay", version, about)]
pub struct Cli {
    /// Bind address [env: PALAVER_BIND] [default: 127.0.0.1:29231]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Largest accepted message body, in encoded bytes
    /// [env: PALAVER_MAX_MESSAGE_BYTES] [default: 10240]
    #[arg(long)]
    pub max_message_bytes: Option<usize>,

    /// Minimum seconds between broadcast sends per user
    /// [env: PALAVER_MIN_SPEAK_INTERVAL_SECS] [default: 3]
    #[arg(long)]
    pub min_speak_interval_secs: Option<u64>,

    /// Cap on per-user mailbox depth, evicting oldest entries
    /// [env: PALAVER_MAX_MAILBOX_MESSAGES] [default: unbounded]
    #[arg(long)]
    pub max_mailbox_messages: Option<usize>,
}

/// Tunables consulted by the dispatcher and guard.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_message_bytes: usize,
    pub min_speak_interval: Duration,
    /// `None` preserves the keep-everything retention of the mailbox store.
    pub max_mailbox_messages: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            min_speak_interval: Duration::from_secs(DEFAULT_MIN_SPEAK_INTERVAL_SECS),
            max_mailbox_messages: None,
        }
    }
}

pub struct Config {
    pub bind_addr: String,
    pub relay: RelayConfig,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| env::var("PALAVER_BIND").ok())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let max_message_bytes = cli
            .max_message_bytes
            .or_else(|| env_parse("PALAVER_MAX_MESSAGE_BYTES"))
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        let min_speak_interval_secs = cli
            .min_speak_interval_secs
            .or_else(|| env_parse("PALAVER_MIN_SPEAK_INTERVAL_SECS"))
            .unwrap_or(DEFAULT_MIN_SPEAK_INTERVAL_SECS);

        let max_mailbox_messages = cli
            .max_mailbox_messages
            .or_else(|| env_parse("PALAVER_MAX_MAILBOX_MESSAGES"));

        Self {
            bind_addr,
            relay: RelayConfig {
                max_message_bytes,
                min_speak_interval: Duration::from_secs(min_speak_interval_secs),
                max_mailbox_messages,
            },
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
