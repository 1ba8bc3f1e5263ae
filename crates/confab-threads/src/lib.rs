//! Threads: append-only conversation logs scoped to a workspace.
//!
//! KV layout:
//!
//! - `thread:info:{uri}` — [`ThreadInfo`] metadata, read cheaply.
//! - `thread:messages:{uri}` — LIST of [`ThreadMessage`], appended via RPUSH.
//! - `thread:index:{workspace}` — SET of thread URIs.
//!
//! A cursor pins the last message a consumer has seen; message ids are
//! time-ordered so "newer" is a plain string comparison.

mod domain;
mod error;
mod service;
mod types;

pub use domain::{list_messages, save_bot_message, ThreadSource};
pub use error::ThreadError;
pub use service::ThreadService;
pub use types::{BotMessagePart, ThreadInfo, ThreadMessage};
