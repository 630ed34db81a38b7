//! The relay dispatcher: binds WebSocket sessions to the shared stores.
//!
//! Each connection moves through `Anonymous` (transport connect) →
//! `Identified` (after `createUser`) → `Closed` (session loop exit). The
//! shared stores — registry, mailbox, history — are service objects with
//! their own interior locks; every dispatcher operation is a short lookup,
//! append, or fire-and-forget send, so no handler ever waits on another
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::config::{RelayConfig, MAX_TARGET_ID_CHARS};
use crate::guard::Guard;
use crate::history::BroadcastHistory;
use crate::logging;
use crate::mailbox::Mailbox;
use crate::protocol::{
    now_millis, BroadcastSend, ClientEvent, ConnectedSnapshot, DirectSend, Identify,
    MessageRecord, ServerEvent, TimestampAck,
};
use crate::registry::Registry;

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(healthcheck))
        .route("/debug/stats", get(debug_stats))
        .with_state(state)
}

#[derive(Clone)]
pub struct RelayState {
    config: RelayConfig,
    guard: Guard,
    registry: Registry,
    mailbox: Mailbox,
    history: BroadcastHistory,
    start_time: Instant,
    sessions: Arc<AtomicUsize>,
}

/// One transport session. `user_id` stays unset while the connection is
/// anonymous and is filled in by `createUser`.
struct Session {
    tx: UnboundedSender<ServerEvent>,
    user_id: Option<String>,
    user_name: Option<String>,
}

impl Session {
    fn new(tx: UnboundedSender<ServerEvent>) -> Self {
        Self {
            tx,
            user_id: None,
            user_name: None,
        }
    }

    fn notify(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    fn warn(&self, text: &str) {
        self.notify(ServerEvent::Pm(MessageRecord::warn(text)));
    }
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let guard = Guard::new(config.max_message_bytes, config.min_speak_interval);
        let mailbox = Mailbox::new(config.max_mailbox_messages);
        Self {
            config,
            guard,
            registry: Registry::new(),
            mailbox,
            history: BroadcastHistory::new(),
            start_time: Instant::now(),
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// First-handshake payload for a freshly connected transport.
    fn connected_snapshot(&self) -> ServerEvent {
        ServerEvent::Connected(ConnectedSnapshot {
            users: self.registry.snapshot(),
            broadcasts: self.history.snapshot(),
        })
    }

    fn handle_event(&self, session: &mut Session, event: ClientEvent) {
        match event {
            ClientEvent::CreateUser(data) => self.identify(session, data),
            ClientEvent::Gm(data) => self.broadcast_send(session, data),
            ClientEvent::Pm(data) => self.direct_send(session, data),
        }
    }

    /// `createUser`: announce the arrival to others (only when the id was not
    /// already present), replay the mailbox to this connection, then register.
    fn identify(&self, session: &mut Session, data: Identify) {
        let Identify { user_id, user_name } = data;

        if !self.registry.is_registered(&user_id) {
            let joined = MessageRecord::joined(user_id.clone(), user_name.clone());
            self.registry
                .broadcast_except(&user_id, &ServerEvent::Broadcast(joined));
        }

        let replayed = self.mailbox.replay(&user_id);
        if !replayed.is_empty() {
            crate::tlog!(
                "relay: replaying {} stored message(s) to {}",
                replayed.len(),
                logging::user_id(&user_id)
            );
        }
        for record in replayed {
            session.notify(ServerEvent::Pm(record));
        }

        self.registry
            .register(&user_id, &user_name, session.tx.clone());
        crate::tlog!("relay: user identified {}", logging::user_id(&user_id));

        session.user_id = Some(user_id);
        session.user_name = Some(user_name);
    }

    /// `gm`: size guard, then the rate guard against the registered sender's
    /// speak state. Once admitted: ack, fan out to everyone else, append to
    /// history — three unconditional steps.
    fn broadcast_send(&self, session: &Session, data: BroadcastSend) {
        if let Err(rejection) = self.guard.admit_size(&data.msg) {
            return session.warn(rejection.warning());
        }
        match self.registry.admit_broadcast(&data.user_id, &self.guard) {
            None => return session.warn("unknown sender"),
            Some(Err(rejection)) => return session.warn(rejection.warning()),
            Some(Ok(())) => {}
        }
        if data.msg.is_empty() {
            return;
        }

        let timestamp = now_millis();
        let record =
            MessageRecord::broadcast(timestamp, data.msg, data.user_id.clone(), data.user_name);
        self.registry.send_to(
            &data.user_id,
            ServerEvent::Timestamp(TimestampAck {
                request_time: data.request_time,
                response_time: timestamp,
            }),
        );
        let delivered = self
            .registry
            .broadcast_except(&data.user_id, &ServerEvent::Broadcast(record.clone()));
        self.history.append(record);
        crate::tlog!(
            "relay: broadcast {} -> {} user(s)",
            logging::user_id(&data.user_id),
            delivered
        );
    }

    /// `pm`: three independent checks — target id length, body size, then
    /// target presence resolved separately (absence is the offline path, not
    /// an error). The sender's mailbox always gets a `SELF` copy and the
    /// target's mailbox always gets the message, live-delivered or not.
    fn direct_send(&self, session: &Session, data: DirectSend) {
        if data.target_id.chars().count() > MAX_TARGET_ID_CHARS {
            return session.warn("invalid target identifier");
        }
        if let Err(rejection) = self.guard.admit_size(&data.msg) {
            return session.warn(rejection.warning());
        }
        if data.msg.is_empty() {
            return;
        }

        let DirectSend {
            user_id,
            user_name,
            target_id,
            target_name,
            msg,
            request_time,
        } = data;
        let timestamp = now_millis();

        let own_copy =
            MessageRecord::own_copy(timestamp, msg.clone(), target_id.clone(), target_name.clone());
        self.mailbox.enqueue(&user_id, own_copy);
        session.notify(ServerEvent::Timestamp(TimestampAck {
            request_time,
            response_time: timestamp,
        }));

        let mut record = MessageRecord::direct(timestamp, msg, user_id.clone(), user_name);
        let delivered = self
            .registry
            .send_to(&target_id, ServerEvent::Pm(record.clone()));
        if !delivered {
            session.notify(ServerEvent::Pm(MessageRecord::offline_notice(
                target_id.clone(),
                target_name,
            )));
            record.mark_queued_offline();
        }
        self.mailbox.enqueue(&target_id, record);
        crate::tlog!(
            "relay: direct {} -> {} ({})",
            logging::user_id(&user_id),
            logging::user_id(&target_id),
            if delivered { "live" } else { "queued" }
        );
    }

    /// Transport close: announce the departure if the session had identified,
    /// then drop the registration.
    fn disconnect(&self, session: &Session, reason: &str) {
        let Some(user_id) = &session.user_id else {
            return;
        };
        let user_name = session.user_name.clone().unwrap_or_default();
        let left = MessageRecord::left(user_id.clone(), user_name, reason.to_string());
        self.registry
            .broadcast_except(user_id, &ServerEvent::Broadcast(left));
        self.registry.unregister(user_id);
        crate::tlog!("relay: user left {} ({reason})", logging::user_id(user_id));
    }
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

async fn debug_stats(State(state): State<RelayState>) -> impl IntoResponse {
    let mailboxes: serde_json::Map<String, serde_json::Value> = state
        .mailbox
        .depths()
        .into_iter()
        .map(|(user_id, depth)| (user_id, serde_json::json!(depth)))
        .collect();

    Json(serde_json::json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "sessions": state.sessions.load(Ordering::Relaxed),
        "online_users": state.registry.snapshot(),
        "mailboxes": mailboxes,
        "history_len": state.history.len(),
        "config": {
            "max_message_bytes": state.config.max_message_bytes,
            "min_speak_interval_secs": state.config.min_speak_interval.as_secs_f64(),
            "max_mailbox_messages": state.config.max_mailbox_messages,
        },
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, addr, state))
}

async fn handle_session(mut socket: WebSocket, addr: SocketAddr, state: RelayState) {
    // First handshake: the relay tells the newcomer who is online and what
    // has been said so far.
    if send_event(&mut socket, &state.connected_snapshot())
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = Session::new(tx);
    state.sessions.fetch_add(1, Ordering::Relaxed);
    crate::tlog!("relay: session connected from {addr}");

    let mut reason = String::from("transport close");
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => state.handle_event(&mut session, event),
                        Err(_) => session.warn("malformed event payload"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        if !frame.reason.is_empty() {
                            reason = frame.reason.to_string();
                        }
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }

    state.disconnect(&session, &reason);
    state.sessions.fetch_sub(1, Ordering::Relaxed);
    crate::tlog!("relay: session closed ({reason})");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_config() -> RelayConfig {
        RelayConfig {
            max_message_bytes: 10 * 1024,
            min_speak_interval: Duration::from_millis(80),
            max_mailbox_messages: None,
        }
    }

    fn open_session() -> (Session, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(tx), rx)
    }

    fn identify(state: &RelayState, session: &mut Session, user_id: &str, user_name: &str) {
        state.handle_event(
            session,
            ClientEvent::CreateUser(Identify {
                user_id: user_id.into(),
                user_name: user_name.into(),
            }),
        );
    }

    fn gm(state: &RelayState, session: &mut Session, user_id: &str, msg: &str) {
        state.handle_event(
            session,
            ClientEvent::Gm(BroadcastSend {
                user_id: user_id.into(),
                user_name: user_id.into(),
                msg: msg.into(),
                request_time: Some(1),
            }),
        );
    }

    fn pm(state: &RelayState, session: &mut Session, from: &str, to: &str, msg: &str) {
        state.handle_event(
            session,
            ClientEvent::Pm(DirectSend {
                user_id: from.into(),
                user_name: from.into(),
                target_id: to.into(),
                target_name: to.into(),
                msg: msg.into(),
                request_time: None,
            }),
        );
    }

    fn expect_broadcast(rx: &mut UnboundedReceiver<ServerEvent>) -> MessageRecord {
        match rx.try_recv().expect("expected a broadcast event") {
            ServerEvent::Broadcast(record) => record,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn expect_pm(rx: &mut UnboundedReceiver<ServerEvent>) -> MessageRecord {
        match rx.try_recv().expect("expected a pm event") {
            ServerEvent::Pm(record) => record,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn expect_ack(rx: &mut UnboundedReceiver<ServerEvent>) -> TimestampAck {
        match rx.try_recv().expect("expected a timestamp ack") {
            ServerEvent::Timestamp(ack) => ack,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn identify_announces_to_others_exactly_once() {
        let state = RelayState::new(test_config());
        let (mut alice, mut alice_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");

        let (mut bob, mut bob_rx) = open_session();
        identify(&state, &mut bob, "bob", "Bob");

        let joined = expect_broadcast(&mut alice_rx);
        assert_eq!(joined.kind, MessageKind::New);
        assert_eq!(joined.user_id.as_deref(), Some("bob"));
        assert!(bob_rx.try_recv().is_err());

        // Re-identifying is idempotent: no second announcement.
        identify(&state, &mut bob, "bob", "Bob");
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_acks_sender_fans_out_and_lands_in_history() {
        let state = RelayState::new(test_config());
        let (mut alice, mut alice_rx) = open_session();
        let (mut bob, mut bob_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");
        identify(&state, &mut bob, "bob", "Bob");
        expect_broadcast(&mut alice_rx); // bob's NEW

        gm(&state, &mut alice, "alice", "hi");

        let ack = expect_ack(&mut alice_rx);
        assert_eq!(ack.request_time, Some(1));
        let record = expect_broadcast(&mut bob_rx);
        assert_eq!(record.kind, MessageKind::Broadcast);
        assert_eq!(record.msg.as_deref(), Some("hi"));
        assert_eq!(record.timestamp, Some(ack.response_time));
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn second_broadcast_within_interval_warns_and_is_not_stored() {
        let state = RelayState::new(test_config());
        let (mut alice, mut alice_rx) = open_session();
        let (mut bob, mut bob_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");
        identify(&state, &mut bob, "bob", "Bob");
        expect_broadcast(&mut alice_rx); // bob's NEW

        gm(&state, &mut alice, "alice", "one");
        gm(&state, &mut alice, "alice", "two");

        expect_ack(&mut alice_rx);
        let warn = expect_pm(&mut alice_rx);
        assert_eq!(warn.kind, MessageKind::Warn);

        std::thread::sleep(Duration::from_millis(100));
        gm(&state, &mut alice, "alice", "three");
        expect_ack(&mut alice_rx);

        let first = expect_broadcast(&mut bob_rx);
        let second = expect_broadcast(&mut bob_rx);
        assert_eq!(first.msg.as_deref(), Some("one"));
        assert_eq!(second.msg.as_deref(), Some("three"));
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(state.history.len(), 2);
    }

    #[test]
    fn oversized_broadcast_is_warned_and_never_stored() {
        let state = RelayState::new(RelayConfig {
            max_message_bytes: 32,
            ..test_config()
        });
        let (mut alice, mut alice_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");

        gm(&state, &mut alice, "alice", &"x".repeat(32));

        let warn = expect_pm(&mut alice_rx);
        assert_eq!(warn.kind, MessageKind::Warn);
        assert!(alice_rx.try_recv().is_err());
        assert!(state.history.is_empty());
    }

    #[test]
    fn broadcast_from_unknown_sender_is_a_validation_failure() {
        let state = RelayState::new(test_config());
        let (mut ghost, mut ghost_rx) = open_session();

        gm(&state, &mut ghost, "ghost", "boo");

        let warn = expect_pm(&mut ghost_rx);
        assert_eq!(warn.kind, MessageKind::Warn);
        assert!(state.history.is_empty());
    }

    #[test]
    fn empty_body_updates_counters_but_is_not_delivered() {
        let state = RelayState::new(test_config());
        let (mut alice, mut alice_rx) = open_session();
        let (mut bob, mut bob_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");
        identify(&state, &mut bob, "bob", "Bob");
        expect_broadcast(&mut alice_rx); // bob's NEW

        gm(&state, &mut alice, "alice", "");
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
        assert!(state.history.is_empty());

        // The empty send still consumed the speak window.
        gm(&state, &mut alice, "alice", "real");
        let warn = expect_pm(&mut alice_rx);
        assert_eq!(warn.kind, MessageKind::Warn);
    }

    #[test]
    fn direct_message_to_offline_target_queues_and_replays_in_order() {
        let state = RelayState::new(test_config());
        let (mut alice, mut alice_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");

        pm(&state, &mut alice, "alice", "bob", "first");
        pm(&state, &mut alice, "alice", "bob", "second");

        expect_ack(&mut alice_rx);
        let notice = expect_pm(&mut alice_rx);
        assert_eq!(notice.kind, MessageKind::Offline);
        assert_eq!(notice.user_id.as_deref(), Some("bob"));
        expect_ack(&mut alice_rx);
        expect_pm(&mut alice_rx);

        // Sender's own mailbox holds SELF copies keyed by the target.
        assert_eq!(state.mailbox.depth("alice"), 2);
        assert_eq!(state.mailbox.depth("bob"), 2);

        let (mut bob, mut bob_rx) = open_session();
        identify(&state, &mut bob, "bob", "Bob");
        let first = expect_pm(&mut bob_rx);
        let second = expect_pm(&mut bob_rx);
        assert_eq!(first.kind, MessageKind::OldPm);
        assert_eq!(first.msg.as_deref(), Some("first"));
        assert_eq!(first.user_id.as_deref(), Some("alice"));
        assert_eq!(second.msg.as_deref(), Some("second"));

        // Replay did not drain the store.
        assert_eq!(state.mailbox.depth("bob"), 2);
    }

    #[test]
    fn direct_message_to_online_target_is_delivered_live() {
        let state = RelayState::new(test_config());
        let (mut alice, mut alice_rx) = open_session();
        let (mut bob, mut bob_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");
        identify(&state, &mut bob, "bob", "Bob");
        expect_broadcast(&mut alice_rx); // bob's NEW

        pm(&state, &mut alice, "alice", "bob", "secret");

        expect_ack(&mut alice_rx);
        assert!(alice_rx.try_recv().is_err(), "no offline notice expected");
        let live = expect_pm(&mut bob_rx);
        assert_eq!(live.kind, MessageKind::Pm);
        assert_eq!(live.msg.as_deref(), Some("secret"));
        // The live-delivered message is still persisted for replay.
        assert_eq!(state.mailbox.depth("bob"), 1);
    }

    #[test]
    fn overlong_target_id_is_rejected_without_mailbox_mutation() {
        let state = RelayState::new(test_config());
        let (mut alice, mut alice_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");

        pm(&state, &mut alice, "alice", "thirteen-char", "hello");

        let warn = expect_pm(&mut alice_rx);
        assert_eq!(warn.kind, MessageKind::Warn);
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(state.mailbox.depth("alice"), 0);
        assert_eq!(state.mailbox.depth("thirteen-char"), 0);
    }

    #[test]
    fn disconnect_announces_leave_and_unregisters() {
        let state = RelayState::new(test_config());
        let (mut alice, mut alice_rx) = open_session();
        let (mut bob, _bob_rx) = open_session();
        identify(&state, &mut alice, "alice", "Alice");
        identify(&state, &mut bob, "bob", "Bob");
        expect_broadcast(&mut alice_rx); // bob's NEW

        state.disconnect(&bob, "transport close");

        let left = expect_broadcast(&mut alice_rx);
        assert_eq!(left.kind, MessageKind::Leave);
        assert_eq!(left.user_id.as_deref(), Some("bob"));
        assert_eq!(left.reason.as_deref(), Some("transport close"));
        assert!(!state.registry.is_registered("bob"));

        // Anonymous sessions close without an announcement.
        let (anon, _anon_rx) = open_session();
        state.disconnect(&anon, "transport close");
        assert!(alice_rx.try_recv().is_err());
    }
}
