use std::fmt;

use nanoid::nanoid;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Length of room codes handed out by [`RoomCode::generate`].
pub const ROOM_CODE_LEN: usize = 6;

const ROOM_CODE_ALPHABET: [char; 36] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Opaque identifier of a chat room, chosen by the client that opens it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Wraps a user-supplied code, returning `None` when it is blank.
    pub fn new(code: impl Into<String>) -> Option<Self> {
        let code = code.into().trim().to_string();
        if code.is_empty() { None } else { Some(Self(code)) }
    }

    /// Produces a short random code for a brand new room.
    ///
    /// There is no uniqueness check: two clients can draw the same code and
    /// end up sharing a room.
    pub fn generate() -> Self {
        Self(nanoid!(ROOM_CODE_LEN, &ROOM_CODE_ALPHABET))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Codes that arrive over the wire skip [`RoomCode::new`], so the relay
    /// checks them with this before touching the registry.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the relay assigns to each accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload of a `sendMessage` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room_code: RoomCode,
    #[serde(rename = "message")]
    pub text: String,
}

/// Events a client emits towards the relay.
///
/// Every frame is a JSON object `{"event": <name>, "data": <payload>}`;
/// multi-argument payloads are encoded as arrays in argument order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinRoom(RoomCode),
    LeaveRoom(RoomCode),
    SendMessage(ChatMessage),
    /// `(is_typing, who, room_code)`
    Typing(bool, String, RoomCode),
    StoppedTyping(RoomCode),
}

/// Events the relay pushes to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    ReceiveMessage(String),
    RoomLeft(RoomCode),
    UserJoined(ConnectionId),
    UserLeft(ConnectionId),
    #[serde(rename = "UserTyping")]
    UserTyping,
    #[serde(rename = "UserNotTyping")]
    UserNotTyping,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed event frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decodes a single text frame into an event.
pub fn decode<T>(frame: &str) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
{
    Ok(serde_json::from_str(frame.trim())?)
}

/// Encodes an event as the body of a single text frame.
pub fn encode<T>(event: &T) -> Result<String, ProtocolError>
where
    T: Serialize,
{
    Ok(serde_json::to_string(event)?)
}
