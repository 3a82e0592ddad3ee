//! agent-session-broker: turns a foreground, interactive agent CLI session
//! into an addressable, queryable asynchronous API.
//!
//! Callers submit textual interactions; the engine serializes their delivery
//! into the live session (tmux + ttyd) and resolves each interaction when the
//! session writes its completion signal to `notify.json` in the session's
//! isolated home directory.

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod notification;
pub mod prepare;
pub mod session;
pub mod types;
