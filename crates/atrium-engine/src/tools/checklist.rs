use std::sync::Arc;

use async_trait::async_trait;
use atrium_core::tools::{require_str, Tool, ToolContext, ToolError, ToolOutput};

use crate::error::EngineError;
use crate::workflow::{StepStatus, WorkflowError, WorkflowEvent, WorkflowManager};

fn engine_to_tool(e: EngineError) -> ToolError {
    ToolError::ExecutionFailed(e.to_string())
}

/// Marks a checklist step of the thread's active run.
pub struct UpdateChecklistStepTool {
    workflows: Arc<WorkflowManager>,
}

impl UpdateChecklistStepTool {
    pub fn new(workflows: Arc<WorkflowManager>) -> Self {
        Self { workflows }
    }
}

#[async_trait]
impl Tool for UpdateChecklistStepTool {
    fn name(&self) -> &str {
        "update_checklist_step"
    }

    fn description(&self) -> &str {
        "Set the status of a step in the current workflow checklist."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["step_id", "status"],
            "properties": {
                "step_id": { "type": "string" },
                "status": { "type": "string", "enum": ["pending", "in_progress", "blocked", "done"] },
                "note": { "type": "string" }
            }
        })
    }

    fn workflow_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let step_id = require_str(&args, "step_id")?;
        let raw = require_str(&args, "status")?;
        let status = StepStatus::parse(raw).ok_or_else(|| ToolError::InvalidArguments(format!("unknown status: {raw}")))?;
        let note = args.get("note").and_then(|v| v.as_str()).map(String::from);

        match self.workflows.update_step(&ctx.tenant, &ctx.thread_id, step_id, status, note).await {
            Ok(run) => {
                let open = run.unmet_steps().len();
                Ok(ToolOutput::text(format!("Step {step_id} is now {status}. {open} step(s) still open.")))
            }
            Err(EngineError::Workflow(e @ (WorkflowError::UnknownStep(_) | WorkflowError::NotFound))) => {
                Ok(ToolOutput::error(e.to_string()))
            }
            Err(e) => Err(engine_to_tool(e)),
        }
    }
}

/// Completes the active run. Rejected with the open-step list unless every step is done.
pub struct CompleteWorkflowTool {
    workflows: Arc<WorkflowManager>,
}

impl CompleteWorkflowTool {
    pub fn new(workflows: Arc<WorkflowManager>) -> Self {
        Self { workflows }
    }
}

#[async_trait]
impl Tool for CompleteWorkflowTool {
    fn name(&self) -> &str {
        "complete_workflow"
    }

    fn description(&self) -> &str {
        "Finish the current workflow. Fails with the list of unfinished steps if any remain."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "What was accomplished" }
            }
        })
    }

    fn workflow_only(&self) -> bool {
        true
    }

    async fn execute(&self, _args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        match self.workflows.apply(&ctx.tenant, &ctx.thread_id, WorkflowEvent::Complete).await {
            Ok(Some(_)) => Ok(ToolOutput::text("Workflow completed.")),
            Ok(None) => Ok(ToolOutput::error("No active workflow on this thread.")),
            Err(EngineError::Workflow(WorkflowError::IncompleteChecklist { unmet })) => {
                let list: Vec<String> = unmet
                    .iter()
                    .map(|s| format!("- {}: {} ({})", s.id, s.title, s.status))
                    .collect();
                Ok(ToolOutput::error(format!(
                    "Cannot complete: these steps are not done:\n{}\nFinish them, then call complete_workflow again.",
                    list.join("\n")
                )))
            }
            Err(EngineError::Workflow(e)) => Ok(ToolOutput::error(e.to_string())),
            Err(e) => Err(engine_to_tool(e)),
        }
    }
}
