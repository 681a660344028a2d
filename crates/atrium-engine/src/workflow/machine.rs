//! Pure workflow state machine. No I/O; the manager persists and publishes.
//!
//! | state            | event                  | next             | effects                          |
//! |------------------|------------------------|------------------|----------------------------------|
//! | running          | user message           | paused           | state changed                    |
//! | paused           | resume keyword         | running          | state changed, resume preamble   |
//! | paused           | user left              | running (bg)     | state changed, mode, preamble    |
//! | running          | wait, tasks pending    | waiting_external | state changed                    |
//! | waiting_external | last callback resolved | running          | state changed, resume w/ result  |
//! | running          | complete, all done     | completed        | state changed                    |
//! | running          | stream stopped         | paused           | state changed                    |
//! | any non-terminal | abandoned              | failed           | state changed                    |
//!
//! Launched tasks join the pending list before the launcher is called, so a
//! callback can never outrun its own bookkeeping. A wait with nothing pending
//! is rejected. Mode follows presence in every non-terminal state.

use atrium_core::launcher::PendingExternalTask;
use atrium_core::{CorrelationId, RunMode, RunState};
use chrono::Utc;

use super::model::{StepStatus, WorkflowRun};
use super::WorkflowError;

#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowEvent {
    /// Presence now points at this run's thread.
    UserEntered,
    /// Presence no longer points at this run's thread.
    UserLeft,
    UserMessage { is_resume: bool },
    /// About to hand `task` to the launcher.
    TaskLaunched { task: PendingExternalTask },
    /// The launcher refused or never got the task.
    LaunchAbandoned { correlation_id: CorrelationId },
    RequestWait,
    CallbackResolved { correlation_id: CorrelationId },
    Complete,
    /// The user stopped the stream mid-turn.
    Interrupted,
    /// The turn ended with nothing left to drive the run.
    Abandon { reason: String },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserEntered => "user_entered",
            Self::UserLeft => "user_left",
            Self::UserMessage { .. } => "user_message",
            Self::TaskLaunched { .. } => "task_launched",
            Self::LaunchAbandoned { .. } => "launch_abandoned",
            Self::RequestWait => "request_wait",
            Self::CallbackResolved { .. } => "callback_resolved",
            Self::Complete => "complete",
            Self::Interrupted => "interrupted",
            Self::Abandon { .. } => "abandon",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Started,
    UserJoined,
    StateChanged { from: RunState, to: RunState },
    ModeChanged(RunMode),
    /// Feed a checklist/pending summary to the brain as its next input.
    InjectResumePreamble,
    /// Feed the callback result to the brain and run a turn.
    ResumeWithCallback(PendingExternalTask),
    /// Append the callback result to history without running a turn.
    RecordCallback(PendingExternalTask),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub from: RunState,
    pub run: WorkflowRun,
    pub effects: Vec<Effect>,
    /// Whether the persisted record differs from the input.
    pub changed: bool,
}

impl Transition {
    pub fn state(&self) -> RunState {
        self.run.state
    }

    pub fn mode(&self) -> RunMode {
        self.run.mode
    }

    pub fn is_noop(&self) -> bool {
        !self.changed && self.effects.is_empty()
    }

    pub fn wants_resume_preamble(&self) -> bool {
        self.effects.contains(&Effect::InjectResumePreamble)
    }

    pub fn callback_to_resume(&self) -> Option<&PendingExternalTask> {
        self.effects.iter().find_map(|e| match e {
            Effect::ResumeWithCallback(task) => Some(task),
            _ => None,
        })
    }

    pub fn callback_to_record(&self) -> Option<&PendingExternalTask> {
        self.effects.iter().find_map(|e| match e {
            Effect::RecordCallback(task) => Some(task),
            _ => None,
        })
    }
}

fn mode_for(on_thread: bool) -> RunMode {
    if on_thread {
        RunMode::Ui
    } else {
        RunMode::Background
    }
}

/// Begin a run. Mode is derived from current presence.
pub fn start(mut run: WorkflowRun, user_on_thread: bool) -> Transition {
    let now = Utc::now();
    run.state = RunState::Running;
    run.mode = mode_for(user_on_thread);
    run.started_at = now;
    run.updated_at = now;
    Transition {
        from: RunState::Running,
        run,
        effects: vec![Effect::Started],
        changed: true,
    }
}

/// Compute the next run and its effects. Never mutates `current`.
pub fn transition(current: &WorkflowRun, event: &WorkflowEvent) -> Result<Transition, WorkflowError> {
    let from = current.state;
    if from.is_terminal() {
        return Err(WorkflowError::InvalidTransition {
            state: from,
            event: event.name(),
        });
    }

    let mut run = current.clone();
    let mut effects = Vec::new();

    match event {
        WorkflowEvent::UserEntered => {
            if run.mode != RunMode::Ui {
                run.mode = RunMode::Ui;
                effects.push(Effect::ModeChanged(RunMode::Ui));
                if from == RunState::Running {
                    effects.push(Effect::UserJoined);
                }
            }
        }
        WorkflowEvent::UserLeft => {
            if from == RunState::Paused {
                run.state = RunState::Running;
                effects.push(Effect::StateChanged {
                    from,
                    to: RunState::Running,
                });
            }
            if run.mode != RunMode::Background {
                run.mode = RunMode::Background;
                effects.push(Effect::ModeChanged(RunMode::Background));
            }
            if from == RunState::Paused {
                effects.push(Effect::InjectResumePreamble);
            }
        }
        WorkflowEvent::UserMessage { is_resume } => match (from, is_resume) {
            (RunState::Running, false) => {
                run.state = RunState::Paused;
                effects.push(Effect::StateChanged {
                    from,
                    to: RunState::Paused,
                });
            }
            (RunState::Paused, true) => {
                run.state = RunState::Running;
                effects.push(Effect::StateChanged {
                    from,
                    to: RunState::Running,
                });
                effects.push(Effect::InjectResumePreamble);
            }
            _ => {}
        },
        WorkflowEvent::TaskLaunched { task } => {
            if run.pending(&task.correlation_id).is_none() {
                run.pending_tasks.push(task.clone());
            }
        }
        WorkflowEvent::LaunchAbandoned { correlation_id } => {
            run.pending_tasks.retain(|p| &p.correlation_id != correlation_id);
        }
        WorkflowEvent::RequestWait => {
            if run.pending_tasks.is_empty() {
                return Err(WorkflowError::NothingPending);
            }
            if from == RunState::Running {
                run.state = RunState::WaitingExternal;
                effects.push(Effect::StateChanged {
                    from,
                    to: RunState::WaitingExternal,
                });
            }
        }
        WorkflowEvent::CallbackResolved { correlation_id } => {
            let Some(idx) = run.pending_tasks.iter().position(|p| &p.correlation_id == correlation_id) else {
                return Err(WorkflowError::UnknownCorrelation(correlation_id.clone()));
            };
            let task = run.pending_tasks.remove(idx);
            match from {
                RunState::WaitingExternal if run.pending_tasks.is_empty() => {
                    run.state = RunState::Running;
                    effects.push(Effect::StateChanged {
                        from,
                        to: RunState::Running,
                    });
                    effects.push(Effect::ResumeWithCallback(task));
                }
                RunState::Running => effects.push(Effect::ResumeWithCallback(task)),
                _ => effects.push(Effect::RecordCallback(task)),
            }
        }
        WorkflowEvent::Complete => {
            if from != RunState::Running {
                return Err(WorkflowError::InvalidTransition {
                    state: from,
                    event: event.name(),
                });
            }
            let unmet = run.unmet_steps();
            if !unmet.is_empty() {
                return Err(WorkflowError::IncompleteChecklist { unmet });
            }
            run.state = RunState::Completed;
            run.completed_at = Some(Utc::now());
            effects.push(Effect::StateChanged {
                from,
                to: RunState::Completed,
            });
        }
        WorkflowEvent::Interrupted => {
            if from == RunState::Running {
                run.state = RunState::Paused;
                effects.push(Effect::StateChanged {
                    from,
                    to: RunState::Paused,
                });
            }
        }
        WorkflowEvent::Abandon { reason } => {
            run.state = RunState::Failed;
            run.failure = Some(reason.clone());
            effects.push(Effect::StateChanged {
                from,
                to: RunState::Failed,
            });
        }
    }

    let changed = run != *current;
    if changed {
        run.updated_at = Utc::now();
    }
    Ok(Transition {
        from,
        run,
        effects,
        changed,
    })
}

/// Set one checklist step's status. Rejected once the run is terminal.
pub fn update_step(
    current: &WorkflowRun,
    step_id: &str,
    status: StepStatus,
    note: Option<String>,
) -> Result<WorkflowRun, WorkflowError> {
    if current.state.is_terminal() {
        return Err(WorkflowError::InvalidTransition {
            state: current.state,
            event: "update_step",
        });
    }
    let mut run = current.clone();
    let step = run
        .step_mut(step_id)
        .ok_or_else(|| WorkflowError::UnknownStep(step_id.to_string()))?;
    step.status = status;
    if note.is_some() {
        step.note = note;
    }
    run.updated_at = Utc::now();
    Ok(run)
}
