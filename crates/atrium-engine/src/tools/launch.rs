use std::sync::Arc;

use async_trait::async_trait;
use atrium_core::launcher::{LaunchError, PendingExternalTask, TaskDescriptor, TaskLauncher};
use atrium_core::tools::{require_str, Tool, ToolContext, ToolError, ToolKind, ToolOutput};
use tracing::{info, warn};

use crate::workflow::WorkflowManager;

/// Hands long-running work to the external launcher and returns at once.
///
/// The task is routable before the launcher sees it, so a callback that beats
/// the acknowledgement still finds its thread. Any launch that does not end
/// accepted is rolled back.
pub struct LaunchExternalTaskTool {
    launcher: Arc<dyn TaskLauncher>,
    workflows: Arc<WorkflowManager>,
}

impl LaunchExternalTaskTool {
    pub fn new(launcher: Arc<dyn TaskLauncher>, workflows: Arc<WorkflowManager>) -> Self {
        Self { launcher, workflows }
    }

    async fn roll_back(&self, ctx: &ToolContext, pending: &PendingExternalTask) {
        self.workflows
            .untrack_launch(&ctx.tenant, &ctx.thread_id, ctx.run_id.as_ref(), &pending.correlation_id)
            .await;
    }
}

#[async_trait]
impl Tool for LaunchExternalTaskTool {
    fn name(&self) -> &str {
        "launch_external_task"
    }

    fn description(&self) -> &str {
        "Start a long-running business task (exports, reconciliations, bulk updates). \
         The result arrives later; this thread waits for it."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["task_type"],
            "properties": {
                "task_type": { "type": "string", "description": "Kind of task to launch" },
                "step_id": { "type": "string", "description": "Checklist step this task completes" },
                "payload": { "type": "object", "description": "Task-specific parameters" }
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::LongRunning
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let task_type = require_str(&args, "task_type")?;
        let step_id = args.get("step_id").and_then(|v| v.as_str()).map(String::from);
        let payload = args.get("payload").cloned().unwrap_or(serde_json::Value::Null);

        let pending = PendingExternalTask::new(task_type, step_id);
        let descriptor = TaskDescriptor {
            correlation_id: pending.correlation_id.clone(),
            task_type: task_type.to_string(),
            user_id: ctx.tenant.user_id.clone(),
            tenant_id: ctx.tenant.tenant_id.clone(),
            thread_id: ctx.thread_id.clone(),
            payload,
        };

        self.workflows
            .track_launch(&ctx.tenant, &ctx.thread_id, ctx.run_id.as_ref(), &pending)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("cannot record launch: {e}")))?;

        let ack = tokio::select! {
            ack = self.launcher.launch(&descriptor) => ack,
            () = ctx.abort_signal.cancelled() => {
                self.roll_back(ctx, &pending).await;
                return Err(ToolError::Cancelled);
            }
        };
        if !matches!(ack, Ok(ref a) if a.accepted) {
            self.roll_back(ctx, &pending).await;
        }

        match ack {
            Ok(ack) if ack.accepted => {
                info!(correlation_id = %pending.correlation_id, task_type, "external task launched");
                Ok(ToolOutput::launched(
                    format!("Launched {task_type} as {}. The result will arrive later.", pending.correlation_id),
                    pending,
                ))
            }
            Ok(ack) => {
                let reason = ack.message.unwrap_or_else(|| "no reason given".into());
                warn!(task_type, %reason, "launcher declined task");
                Ok(ToolOutput::error(format!("Launcher declined {task_type}: {reason}")))
            }
            Err(LaunchError::Rejected(reason)) => Ok(ToolOutput::error(format!("Launcher rejected {task_type}: {reason}"))),
            Err(e @ LaunchError::Unreachable(_)) => Err(ToolError::ExecutionFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{ctx, started_workflows, workflows};
    use atrium_core::launcher::LaunchAck;
    use parking_lot::Mutex;

    struct RecordingLauncher {
        accept: bool,
        seen: Mutex<Vec<TaskDescriptor>>,
        /// Whether the route existed when the launcher was called.
        routed: Mutex<Vec<bool>>,
        workflows: Option<Arc<WorkflowManager>>,
    }

    impl RecordingLauncher {
        fn new(accept: bool) -> Self {
            Self {
                accept,
                seen: Mutex::new(Vec::new()),
                routed: Mutex::new(Vec::new()),
                workflows: None,
            }
        }
    }

    #[async_trait]
    impl TaskLauncher for RecordingLauncher {
        async fn launch(&self, descriptor: &TaskDescriptor) -> Result<LaunchAck, LaunchError> {
            if let Some(workflows) = &self.workflows {
                let c = ctx(None);
                let route = workflows.route(&c.tenant, &descriptor.correlation_id).await;
                self.routed.lock().push(route.is_some());
            }
            self.seen.lock().push(descriptor.clone());
            Ok(LaunchAck {
                accepted: self.accept,
                message: (!self.accept).then(|| "quota exhausted".to_string()),
            })
        }
    }

    struct DownLauncher;

    #[async_trait]
    impl TaskLauncher for DownLauncher {
        async fn launch(&self, _descriptor: &TaskDescriptor) -> Result<LaunchAck, LaunchError> {
            Err(LaunchError::Unreachable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn accepted_launch_returns_pending_task() {
        let launcher = Arc::new(RecordingLauncher::new(true));
        let tool = LaunchExternalTaskTool::new(launcher.clone(), workflows());
        let out = tool
            .execute(
                serde_json::json!({"task_type": "export", "step_id": "collect", "payload": {"day": "mon"}}),
                &ctx(None),
            )
            .await
            .unwrap();

        let pending = out.launched.unwrap();
        assert_eq!(pending.task_type, "export");
        assert_eq!(pending.step_id.as_deref(), Some("collect"));
        let seen = launcher.seen.lock();
        assert_eq!(seen[0].correlation_id, pending.correlation_id);
        assert_eq!(seen[0].payload["day"], "mon");
    }

    #[tokio::test]
    async fn declined_launch_is_error_output() {
        let launcher = Arc::new(RecordingLauncher::new(false));
        let tool = LaunchExternalTaskTool::new(launcher.clone(), workflows());
        let out = tool
            .execute(serde_json::json!({"task_type": "export"}), &ctx(None))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.launched.is_none());
        assert!(out.content.contains("quota exhausted"));
    }

    #[tokio::test]
    async fn task_is_tracked_before_launcher_runs() {
        let (mgr, run_id) = started_workflows().await;
        let mut launcher = RecordingLauncher::new(true);
        launcher.workflows = Some(mgr.clone());
        let launcher = Arc::new(launcher);
        let tool = LaunchExternalTaskTool::new(launcher.clone(), mgr.clone());
        let c = ctx(Some(run_id));

        let out = tool
            .execute(serde_json::json!({"task_type": "export", "step_id": "collect"}), &c)
            .await
            .unwrap();
        assert_eq!(*launcher.routed.lock(), vec![true]);
        let pending = out.launched.unwrap();
        let run = mgr.get(&c.tenant, &c.thread_id).await.unwrap();
        assert!(run.pending(&pending.correlation_id).is_some());
    }

    #[tokio::test]
    async fn declined_launch_is_rolled_back() {
        let (mgr, run_id) = started_workflows().await;
        let launcher = Arc::new(RecordingLauncher::new(false));
        let tool = LaunchExternalTaskTool::new(launcher.clone(), mgr.clone());
        let c = ctx(Some(run_id));

        tool.execute(serde_json::json!({"task_type": "export"}), &c).await.unwrap();
        let correlation_id = launcher.seen.lock()[0].correlation_id.clone();
        assert!(mgr.route(&c.tenant, &correlation_id).await.is_none());
        assert!(mgr.get(&c.tenant, &c.thread_id).await.unwrap().pending_tasks.is_empty());
    }

    #[tokio::test]
    async fn unreachable_launcher_fails_and_rolls_back() {
        let (mgr, run_id) = started_workflows().await;
        let tool = LaunchExternalTaskTool::new(Arc::new(DownLauncher), mgr.clone());
        let c = ctx(Some(run_id));
        let err = tool
            .execute(serde_json::json!({"task_type": "export"}), &c)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
        assert!(mgr.get(&c.tenant, &c.thread_id).await.unwrap().pending_tasks.is_empty());
    }

    #[tokio::test]
    async fn missing_task_type_is_invalid() {
        let tool = LaunchExternalTaskTool::new(Arc::new(DownLauncher), workflows());
        let err = tool.execute(serde_json::json!({}), &ctx(None)).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
