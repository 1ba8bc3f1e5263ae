//! The workspace layer: cross-replica channels, the singleton supervisor,
//! the chatbot orchestrator, and the request-local client-reply service.
//!
//! One supervisor per workspace across the whole cluster, enforced by a
//! distributed lock. Requests arrive on a KV list, responses stream back on
//! per-channel lists terminated by a close or error sentinel.

pub mod bot;
pub mod chatbot;
pub mod client_reply;
mod error;
pub mod llm_service;
pub mod requests;
pub mod server;
pub mod store;
pub mod tools;

pub use bot::{bot_acquire, bot_save_update, default_persona, BotState, Capability, Persona};
pub use chatbot::{ChatbotArguments, ChatbotProcess, MAX_COMPLETIONS};
pub use client_reply::{ClientReplyService, ProvisionalReply};
pub use error::WorkspaceError;
pub use llm_service::{LlmProxy, LlmService};
pub use requests::{
    ClientAction, ReplyStatus, RequestInfo, WorkspaceRequest, WorkspaceResponse, WorkspaceStream,
    WrappedRequest,
};
pub use server::{WorkspaceRegistry, WorkspaceServer};
pub use store::{
    recv_action_by_secret, resolve_process_secret, resolve_service_secret, RegisteredProcess,
    RegisteredService, WorkspaceStore,
};
