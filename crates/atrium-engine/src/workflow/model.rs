use std::fmt;

use atrium_core::launcher::PendingExternalTask;
use atrium_core::{CorrelationId, RunId, RunMode, RunState, TenantKey, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Done,
}

impl StepStatus {
    pub fn is_done(self) -> bool {
        self == Self::Done
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistStep {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ChecklistStep {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: StepStatus::Pending,
            note: None,
        }
    }
}

/// A step that blocks completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetStep {
    pub id: String,
    pub title: String,
    pub status: StepStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub tenant: TenantKey,
    pub thread_id: ThreadId,
    pub task_name: String,
    pub instructions: String,
    pub state: RunState,
    pub mode: RunMode,
    pub checklist: Vec<ChecklistStep>,
    #[serde(default)]
    pub pending_tasks: Vec<PendingExternalTask>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the run was abandoned, when it ended `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl WorkflowRun {
    /// A fresh running run. [`crate::workflow::machine::start`] derives its mode.
    pub fn new(
        tenant: TenantKey,
        thread_id: ThreadId,
        task_name: impl Into<String>,
        instructions: impl Into<String>,
        checklist: Vec<ChecklistStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            tenant,
            thread_id,
            task_name: task_name.into(),
            instructions: instructions.into(),
            state: RunState::Running,
            mode: RunMode::Background,
            checklist,
            pending_tasks: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            failure: None,
        }
    }

    /// Tool calls are required only while the run is actively executing.
    pub fn tools_constrained(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn unmet_steps(&self) -> Vec<UnmetStep> {
        self.checklist
            .iter()
            .filter(|s| !s.status.is_done())
            .map(|s| UnmetStep {
                id: s.id.clone(),
                title: s.title.clone(),
                status: s.status,
            })
            .collect()
    }

    pub fn pending(&self, correlation_id: &CorrelationId) -> Option<&PendingExternalTask> {
        self.pending_tasks.iter().find(|p| &p.correlation_id == correlation_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut ChecklistStep> {
        self.checklist.iter_mut().find(|s| s.id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> WorkflowRun {
        WorkflowRun::new(
            TenantKey::new("u", "t"),
            ThreadId::from_raw("ops"),
            "daily-report",
            "Compile the daily report",
            vec![ChecklistStep::new("collect", "Collect numbers"), ChecklistStep::new("send", "Send report")],
        )
    }

    #[test]
    fn unmet_lists_open_steps_in_order() {
        let mut r = run();
        r.checklist[0].status = StepStatus::Done;
        r.checklist[1].status = StepStatus::Blocked;
        let unmet = r.unmet_steps();
        assert_eq!(unmet.len(), 1);
        assert_eq!(unmet[0].id, "send");
        assert_eq!(unmet[0].status, StepStatus::Blocked);
    }

    #[test]
    fn status_parse_round_trip() {
        for s in [StepStatus::Pending, StepStatus::InProgress, StepStatus::Blocked, StepStatus::Done] {
            assert_eq!(StepStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(StepStatus::parse("finished"), None);
    }

    #[test]
    fn record_serializes_snake_case() {
        let json = serde_json::to_value(run()).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["checklist"][0]["status"], "pending");
    }
}
