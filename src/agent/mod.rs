//! Agent subprocess sessions and their supporting pieces.
//!
//! - [`session::AgentSession`] owns one agent-CLI child per repo workspace.
//! - [`stream`] models the streaming-JSON protocol read from agent stdout.
//! - [`history`] bounds the per-user conversation memory.

pub mod history;
pub mod session;
pub mod stream;

pub use session::{AgentSession, SessionActivity};
