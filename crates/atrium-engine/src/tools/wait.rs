use std::sync::Arc;

use async_trait::async_trait;
use atrium_core::tools::{Tool, ToolContext, ToolError, ToolOutput, WAIT_TOOL_NAME};

use crate::workflow::WorkflowManager;

/// Parks the thread until an outstanding external task calls back.
///
/// Executing it only checks there is something to wait for; the brain sees a
/// successful call and ends the loop in the waiting state.
pub struct WaitOnExternalTaskTool {
    workflows: Arc<WorkflowManager>,
}

impl WaitOnExternalTaskTool {
    pub fn new(workflows: Arc<WorkflowManager>) -> Self {
        Self { workflows }
    }
}

#[async_trait]
impl Tool for WaitOnExternalTaskTool {
    fn name(&self) -> &str {
        WAIT_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Pause this workflow until a launched external task reports back. \
         Use after launch_external_task when nothing else can progress."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "correlation_id": {
                    "type": "string",
                    "description": "Task to wait for. Omit to wait for any pending task."
                },
                "reason": { "type": "string" }
            }
        })
    }

    fn workflow_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let pending = self
            .workflows
            .active(&ctx.tenant, &ctx.thread_id)
            .await
            .map(|run| run.pending_tasks.len())
            .unwrap_or(0);
        if pending == 0 {
            return Ok(ToolOutput::error(
                "Nothing to wait for: no external task is pending. Launch one with launch_external_task first.",
            ));
        }
        let target = args
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .unwrap_or("any pending task");
        Ok(ToolOutput::text(format!("Waiting for {target}.")))
    }
}
