use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    client::SessionConfig,
    message::RoomCode,
    relay::{DEFAULT_WS_PATH, RelayConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket connections.
    Server(ServerArgs),
    /// Connect to a relay and chat in a room.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Path the WebSocket endpoint is served on.
    #[arg(long, default_value = DEFAULT_WS_PATH)]
    pub path: String,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            listen: self.listen,
            path: self.path.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the relay.
    #[arg(long, env = "CHAT_RELAY_URL", default_value = "ws://127.0.0.1:3000/ws")]
    pub server: String,

    /// Code of an existing room to join. A new code is generated when omitted.
    #[arg(long)]
    pub room: Option<String>,

    /// Quiet period after the last keystroke before "stopped typing" is sent.
    #[arg(long, default_value_t = 3000)]
    pub typing_window_ms: u64,
}

impl ClientArgs {
    pub fn session_config(&self) -> Result<SessionConfig> {
        let room_code = match &self.room {
            Some(code) => RoomCode::new(code.as_str()).context("room code cannot be empty")?,
            None => RoomCode::generate(),
        };

        Ok(SessionConfig {
            url: self.server.clone(),
            room_code,
            typing_window: Duration::from_millis(self.typing_window_ms),
        })
    }
}
