//! ASP WebSocket server.
//!
//! One connection per media bridge. On accept the server sends exactly
//! one `protocol.capabilities`, then dispatches control JSON and binary
//! audio frames. Malformed or unknown messages are answered with
//! `protocol.error` and never alter state; frames for unknown session
//! hashes are dropped.

mod connection;

pub use connection::AgentServer;
