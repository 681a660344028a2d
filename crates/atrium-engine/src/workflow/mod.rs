//! Workflow runs: a checklist-driven background task bound to one thread.
//!
//! State changes go through [`machine::transition`], a pure function of the
//! current run and an event. [`WorkflowManager`] loads the run, applies the
//! transition, persists the result and publishes the resulting events.

pub mod machine;
pub mod manager;
pub mod model;
pub mod preamble;

pub use machine::{transition, Effect, Transition, WorkflowEvent};
pub use manager::{PendingRoute, WorkflowManager};
pub use model::{ChecklistStep, StepStatus, UnmetStep, WorkflowRun};

use atrium_core::{CorrelationId, RunState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// Completion was requested while steps are still open. Carries every open step.
    #[error("workflow cannot complete, unfinished steps: {}", format_unmet(.unmet))]
    IncompleteChecklist { unmet: Vec<UnmetStep> },

    #[error("event {event} not allowed while {state}")]
    InvalidTransition { state: RunState, event: &'static str },

    #[error("no pending external task {0}")]
    UnknownCorrelation(CorrelationId),

    #[error("unknown checklist step: {0}")]
    UnknownStep(String),

    #[error("a workflow run is already active on this thread")]
    AlreadyActive,

    #[error("no workflow run on this thread")]
    NotFound,

    /// A wait was requested but no launched task is outstanding, so nothing could ever resume the run.
    #[error("nothing to wait for: no external task is pending")]
    NothingPending,
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IncompleteChecklist { .. } => "incomplete_checklist",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnknownCorrelation(_) => "unknown_correlation",
            Self::UnknownStep(_) => "unknown_step",
            Self::AlreadyActive => "workflow_active",
            Self::NotFound => "workflow_not_found",
            Self::NothingPending => "nothing_pending",
        }
    }
}

fn format_unmet(unmet: &[UnmetStep]) -> String {
    unmet
        .iter()
        .map(|s| format!("{} ({})", s.id, s.status))
        .collect::<Vec<_>>()
        .join(", ")
}
