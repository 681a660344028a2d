//! Shared vocabulary for the Atrium orchestration engine: identifiers, tenant
//! keys, conversation messages and the collaborator contracts (completion,
//! tools, external task launcher, notification events).

pub mod errors;
pub mod events;
pub mod ids;
pub mod launcher;
pub mod messages;
pub mod provider;
pub mod run;
pub mod stream;
pub mod tenant;
pub mod tokens;
pub mod tools;

pub use errors::CompletionError;
pub use ids::{CorrelationId, HolderId, RunId, StreamId, TenantId, ThreadId, ToolCallId, UserId};
pub use run::{RunMode, RunState};
pub use tenant::TenantKey;
