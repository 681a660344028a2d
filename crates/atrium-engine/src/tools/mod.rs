pub mod checklist;
pub mod launch;
pub mod wait;

use std::sync::Arc;

use atrium_core::launcher::TaskLauncher;

use crate::registry::ToolRegistry;
use crate::workflow::WorkflowManager;

/// Registry with the workflow tools every brain needs. Domain tools are added by the caller.
pub fn create_default_registry(workflows: Arc<WorkflowManager>, launcher: Arc<dyn TaskLauncher>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(wait::WaitOnExternalTaskTool::new(workflows.clone())));
    registry.register(Arc::new(launch::LaunchExternalTaskTool::new(launcher, workflows.clone())));

    // Checklist bookkeeping
    registry.register(Arc::new(checklist::UpdateChecklistStepTool::new(workflows.clone())));
    registry.register(Arc::new(checklist::CompleteWorkflowTool::new(workflows)));

    registry
}
