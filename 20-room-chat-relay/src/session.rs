//! Per-room client state machine.
//!
//! `ChatSession` holds everything a chat screen shows and decides which
//! events to emit, but performs no I/O itself: every transition returns the
//! [`ClientEvent`]s the caller should push onto the transport. The async
//! driver in [`crate::client`] feeds it socket frames, user actions and
//! timer expiries one at a time.

use std::{collections::BTreeSet, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    message::{ChatMessage, ClientEvent, ConnectionId, RoomCode, ServerEvent},
    typing::{TypingDebounce, TypingSignal},
};

/// Name the client reports for itself in typing notifications.
const SELF_NAME: &str = "me";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joined,
    Leaving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Me,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayMessage {
    pub text: String,
    pub from: Origin,
}

impl DisplayMessage {
    pub fn me(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from: Origin::Me,
        }
    }

    pub fn other(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from: Origin::Other,
        }
    }
}

/// Snapshot of a session for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub room_code: RoomCode,
    pub messages: Vec<DisplayMessage>,
    pub peer_typing: bool,
    pub peers: BTreeSet<ConnectionId>,
    /// Set when the transport dropped underneath an active session.
    pub connection_lost: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {action} a session that is {state:?}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },
    #[error("chat session has closed")]
    Closed,
}

#[derive(Debug)]
pub struct ChatSession {
    room_code: RoomCode,
    state: SessionState,
    input: String,
    messages: Vec<DisplayMessage>,
    peer_typing: bool,
    peers: BTreeSet<ConnectionId>,
    typing: TypingDebounce,
    connection_lost: bool,
}

impl ChatSession {
    /// Prepares a session for `room_code`. Nothing is opened until
    /// [`ChatSession::connect`].
    pub fn new(room_code: RoomCode, typing_window: Duration) -> Self {
        Self {
            room_code,
            state: SessionState::Disconnected,
            input: String::new(),
            messages: Vec::new(),
            peer_typing: false,
            peers: BTreeSet::new(),
            typing: TypingDebounce::new(typing_window),
            connection_lost: false,
        }
    }

    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn peer_typing(&self) -> bool {
        self.peer_typing
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            room_code: self.room_code.clone(),
            messages: self.messages.clone(),
            peer_typing: self.peer_typing,
            peers: self.peers.clone(),
            connection_lost: self.connection_lost,
        }
    }

    /// Marks the session as opening its transport.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                action: "connect",
                state: self.state,
            });
        }
        self.state = SessionState::Connecting;
        self.connection_lost = false;
        Ok(())
    }

    /// Transport is up: join optimistically, without waiting for the relay.
    pub fn on_connected(&mut self) -> Vec<ClientEvent> {
        if self.state != SessionState::Connecting {
            return Vec::new();
        }
        self.state = SessionState::Joined;
        vec![ClientEvent::JoinRoom(self.room_code.clone())]
    }

    /// Records an edit of the input box.
    pub fn input_changed(&mut self, text: impl Into<String>, now: Instant) -> Vec<ClientEvent> {
        self.input = text.into();
        if self.state != SessionState::Joined {
            return Vec::new();
        }

        match self.typing.keystroke(now) {
            Some(TypingSignal::Started) => vec![ClientEvent::Typing(
                true,
                SELF_NAME.to_string(),
                self.room_code.clone(),
            )],
            _ => Vec::new(),
        }
    }

    /// Sends the current input, rendering it locally first.
    ///
    /// Blank input is not sent. Outside [`SessionState::Joined`] the input is
    /// kept and nothing is emitted.
    pub fn submit(&mut self) -> Vec<ClientEvent> {
        if self.state != SessionState::Joined {
            return Vec::new();
        }

        let text = std::mem::take(&mut self.input);
        if text.trim().is_empty() {
            return Vec::new();
        }

        self.messages.push(DisplayMessage::me(text.clone()));
        self.typing.cancel();
        vec![
            ClientEvent::SendMessage(ChatMessage {
                room_code: self.room_code.clone(),
                text,
            }),
            ClientEvent::StoppedTyping(self.room_code.clone()),
        ]
    }

    /// Replaces the input with `text` and submits it.
    pub fn send(&mut self, text: impl Into<String>) -> Vec<ClientEvent> {
        self.input = text.into();
        self.submit()
    }

    /// When the driver should call [`ChatSession::on_timer`] next.
    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing.deadline()
    }

    pub fn on_timer(&mut self, now: Instant) -> Vec<ClientEvent> {
        match self.typing.poll_expired(now) {
            Some(TypingSignal::Stopped) if self.state == SessionState::Joined => {
                vec![ClientEvent::StoppedTyping(self.room_code.clone())]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_server_event(&mut self, event: ServerEvent) {
        if self.state != SessionState::Joined {
            debug!(?event, state = ?self.state, "ignoring event outside of a joined room");
            return;
        }

        match event {
            ServerEvent::ReceiveMessage(text) => self.messages.push(DisplayMessage::other(text)),
            ServerEvent::UserTyping => self.peer_typing = true,
            ServerEvent::UserNotTyping => self.peer_typing = false,
            ServerEvent::UserJoined(peer) => {
                self.peers.insert(peer);
            }
            ServerEvent::UserLeft(peer) => {
                self.peers.remove(&peer);
            }
            ServerEvent::RoomLeft(room) => debug!(room = %room, "relay confirmed leave"),
        }
    }

    /// Starts leaving. Returns the `leaveRoom` emit when the room was joined.
    pub fn leave(&mut self) -> Vec<ClientEvent> {
        self.typing.cancel();
        match self.state {
            SessionState::Joined => {
                self.state = SessionState::Leaving;
                vec![ClientEvent::LeaveRoom(self.room_code.clone())]
            }
            SessionState::Connecting => {
                self.state = SessionState::Leaving;
                Vec::new()
            }
            SessionState::Leaving | SessionState::Disconnected => Vec::new(),
        }
    }

    /// The transport is closed: discard everything tied to the room.
    pub fn on_closed(&mut self) {
        self.state = SessionState::Disconnected;
        self.input.clear();
        self.messages.clear();
        self.peer_typing = false;
        self.peers.clear();
        self.typing.reset();
    }

    /// The transport failed without the user asking to leave.
    pub fn on_transport_lost(&mut self) {
        self.connection_lost = true;
        self.on_closed();
    }
}
