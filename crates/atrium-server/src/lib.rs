//! Serving layer for Atrium: tenant sessions, the orchestrator facade that
//! exposes the six tenant-scoped operations, per-tenant callback mailboxes,
//! HTTP collaborators and the axum surface.

pub mod client;
pub mod context;
pub mod error;
pub mod event_bridge;
pub mod handlers;
pub mod mailbox;
pub mod manager;
pub mod notify;
pub mod orchestrator;
pub mod remote;
pub mod response;
pub mod rpc;
pub mod scheduler;
pub mod server;
pub mod session;

pub use context::{BusinessContext, BusinessContextProvider, HttpContextProvider, StaticContextProvider};
pub use error::ServerError;
pub use manager::SessionManager;
pub use notify::{BroadcastNotifier, UserEvent};
pub use orchestrator::{
    CallbackOutcome, CallbackReply, MessageReply, Orchestrator, OrchestratorDeps, PresenceReply, ScheduledTask,
    TickOutcome,
};
pub use remote::{HttpCompletionProvider, HttpTaskLauncher, UnconfiguredLauncher};
pub use response::{ApiError, ApiResponse};
pub use scheduler::Scheduler;
pub use server::{start, ServerConfig, ServerHandle};
