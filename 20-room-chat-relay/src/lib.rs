//! Room-based chat relay and its client session.
//!
//! A relay server tracks which connections sit in which chat room and fans
//! out message, presence and typing events over WebSockets. The client side
//! keeps one session per room and owns its socket for the lifetime of that
//! session.
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`message`] defines room codes, connection ids and the JSON event frames.
//! - [`registry`] holds authoritative room membership and computes fan-out.
//! - [`relay`] serves the WebSocket endpoint and routes events through the
//!   registry.
//! - [`typing`] debounces outbound typing notifications.
//! - [`session`] is the I/O-free client state machine.
//! - [`client`] drives a session over a real socket and renders it in a
//!   terminal.

pub mod cli;
pub mod client;
pub mod message;
pub mod registry;
pub mod relay;
pub mod session;
pub mod typing;
