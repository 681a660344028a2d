use std::collections::HashMap;
use std::sync::Arc;

use atrium_core::tools::{Tool, ToolDefinition};

/// Which tools a turn may see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolScope {
    /// A workflow run is actively executing: every tool, calls required.
    Workflow,
    /// Free conversation: workflow-only tools are hidden.
    Conversation,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let _ = self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` may run under `scope`.
    pub fn allowed(&self, name: &str, scope: ToolScope) -> bool {
        self.tools
            .get(name)
            .is_some_and(|t| scope == ToolScope::Workflow || !t.workflow_only())
    }

    /// Tool schema for the completion capability, sorted by name.
    pub fn definitions(&self, scope: ToolScope) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| scope == ToolScope::Workflow || !t.workflow_only())
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atrium_core::tools::{ToolContext, ToolError, ToolOutput};

    struct DummyTool {
        name: &'static str,
        workflow_only: bool,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "dummy"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn workflow_only(&self) -> bool {
            self.workflow_only
        }
        async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("ok"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool {
            name: "lookup_invoice",
            workflow_only: false,
        }));
        reg.register(Arc::new(DummyTool {
            name: "complete_workflow",
            workflow_only: true,
        }));
        reg
    }

    #[test]
    fn conversation_scope_hides_workflow_tools() {
        let reg = registry();
        let names: Vec<String> = reg.definitions(ToolScope::Conversation).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["lookup_invoice"]);
        assert!(!reg.allowed("complete_workflow", ToolScope::Conversation));
    }

    #[test]
    fn workflow_scope_sees_everything_sorted() {
        let reg = registry();
        let names: Vec<String> = reg.definitions(ToolScope::Workflow).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["complete_workflow", "lookup_invoice"]);
        assert!(reg.allowed("complete_workflow", ToolScope::Workflow));
        assert!(!reg.allowed("missing", ToolScope::Workflow));
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let mut reg = registry();
        reg.register(Arc::new(DummyTool {
            name: "lookup_invoice",
            workflow_only: true,
        }));
        assert_eq!(reg.count(), 2);
        assert!(reg.unregister("lookup_invoice"));
        assert!(!reg.contains("lookup_invoice"));
        assert_eq!(reg.names(), vec!["complete_workflow".to_string()]);
    }
}
