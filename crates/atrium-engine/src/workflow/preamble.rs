//! Synthetic inputs fed to the brain when a workflow picks up again.

use std::fmt::Write;

use atrium_core::launcher::{CallbackStatus, PendingExternalTask, TaskCallback};

use super::model::{StepStatus, WorkflowRun};

/// Summary of checklist progress and outstanding external work.
pub fn resume_preamble(run: &WorkflowRun) -> String {
    let mut out = format!("Resuming workflow \"{}\".", run.task_name);
    if !run.instructions.is_empty() {
        let _ = write!(out, "\nInstructions: {}", run.instructions);
    }

    let done = run.checklist.iter().filter(|s| s.status == StepStatus::Done).count();
    let _ = write!(out, "\nChecklist ({done}/{} done):", run.checklist.len());
    for step in &run.checklist {
        let mark = if step.status.is_done() { "x" } else { " " };
        let _ = write!(out, "\n- [{mark}] {}: {} ({})", step.id, step.title, step.status);
        if let Some(note) = &step.note {
            let _ = write!(out, " note: {note}");
        }
    }

    if run.pending_tasks.is_empty() {
        out.push_str("\nNo external tasks are pending.");
    } else {
        out.push_str("\nPending external tasks:");
        for task in &run.pending_tasks {
            let _ = write!(out, "\n- {} ({})", task.correlation_id, task.task_type);
            if let Some(step) = &task.step_id {
                let _ = write!(out, " blocking step {step}");
            }
        }
    }

    out.push_str("\nContinue with the next open step. Call complete_workflow once every step is done.");
    out
}

/// First input for a freshly started run.
pub fn kickoff(run: &WorkflowRun) -> String {
    let mut out = format!("Scheduled task \"{}\" started.", run.task_name);
    if !run.instructions.is_empty() {
        let _ = write!(out, "\n{}", run.instructions);
    }
    if !run.checklist.is_empty() {
        out.push_str("\nChecklist:");
        for step in &run.checklist {
            let _ = write!(out, "\n- {}: {}", step.id, step.title);
        }
    }
    out
}

/// Result of an external task, phrased as the brain's next input.
pub fn callback_input(task: &PendingExternalTask, callback: &TaskCallback) -> String {
    let outcome = match callback.status {
        CallbackStatus::Succeeded => "completed",
        CallbackStatus::Failed => "failed",
    };
    let mut out = format!(
        "External task {} ({}) {outcome}.",
        task.correlation_id, task.task_type
    );
    if let Some(step) = &task.step_id {
        let _ = write!(out, " It was blocking step {step}.");
    }
    if !callback.result.is_null() {
        let _ = write!(out, "\nResult: {}", callback.result);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::ChecklistStep;
    use atrium_core::{TenantKey, ThreadId};

    fn run() -> WorkflowRun {
        let mut run = WorkflowRun::new(
            TenantKey::new("u", "t"),
            ThreadId::from_raw("ops"),
            "daily-report",
            "Compile yesterday's numbers",
            vec![ChecklistStep::new("collect", "Collect numbers"), ChecklistStep::new("send", "Send report")],
        );
        run.checklist[0].status = StepStatus::Done;
        run.pending_tasks
            .push(PendingExternalTask::new("export", Some("send".into())));
        run
    }

    #[test]
    fn preamble_summarizes_checklist_and_pending() {
        let text = resume_preamble(&run());
        assert!(text.contains("Checklist (1/2 done)"));
        assert!(text.contains("- [x] collect: Collect numbers (done)"));
        assert!(text.contains("- [ ] send: Send report (pending)"));
        assert!(text.contains("(export) blocking step send"));
    }

    #[test]
    fn kickoff_lists_steps() {
        let text = kickoff(&run());
        assert!(text.starts_with("Scheduled task \"daily-report\" started."));
        assert!(text.contains("- send: Send report"));
    }

    #[test]
    fn callback_input_includes_result() {
        let r = run();
        let task = &r.pending_tasks[0];
        let cb = TaskCallback {
            user_id: "u".into(),
            tenant_id: "t".into(),
            correlation_id: task.correlation_id.clone(),
            task_type: None,
            status: CallbackStatus::Succeeded,
            result: serde_json::json!({"rows": 42}),
        };
        let text = callback_input(task, &cb);
        assert!(text.contains("(export) completed"));
        assert!(text.contains(r#"{"rows":42}"#));
    }
}
