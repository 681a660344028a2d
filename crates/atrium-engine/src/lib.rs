//! The per-thread turn loop ("brain"), the workflow pause/resume state
//! machine, streaming control and the built-in workflow tools.

pub mod brain;
pub mod compaction;
pub mod debounce;
pub mod error;
pub mod mock;
pub mod registry;
pub mod streaming;
pub mod tools;
pub mod workflow;

pub use brain::{Brain, BrainConfig, BrainOutcome, BrainServices, TurnInput};
pub use compaction::{CompactionResult, Compactor};
pub use error::EngineError;
pub use registry::{ToolRegistry, ToolScope};
pub use streaming::{StopOutcome, StreamGuard, StreamingController};
pub use tools::create_default_registry;
pub use workflow::{
    ChecklistStep, PendingRoute, StepStatus, Transition, WorkflowError, WorkflowEvent, WorkflowManager, WorkflowRun,
};
