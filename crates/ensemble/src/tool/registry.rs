use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;

use super::Tool;

/// Maps tool names to their callable capability descriptors.
///
/// Mutable only while the orchestrator is being assembled; workers resolve
/// their bindings at build time and the registry is never touched mid-run.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under the name its definition declares.
    /// Fails when another tool already holds that name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), Error> {
        let name = tool.definition().name;
        if self.tools.contains_key(&name) {
            return Err(Error::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Resolve a tool by name. Fails when no tool holds that name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, Error> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered tool names in sorted order, for stable logs and prompts.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolDefinition;
    use crate::tool::ToolOutput;
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;

    struct StubTool {
        name: String,
    }

    impl Tool for StubTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.clone(),
                description: format!("stub tool {}", self.name),
                input_schema: json!({"type": "object"}),
            }
        }

        fn execute(
            &self,
            _input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
            Box::pin(async { Ok(ToolOutput::success("stub")) })
        }
    }

    fn stub(name: &str) -> Arc<dyn Tool> {
        Arc::new(StubTool { name: name.into() })
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = ToolRegistry::new();
        registry.register(stub("sql_query")).unwrap();

        let tool = registry.resolve("sql_query").unwrap();
        assert_eq!(tool.definition().name, "sql_query");
        assert!(registry.contains("sql_query"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(stub("render_chart")).unwrap();

        let err = registry.register(stub("render_chart")).unwrap_err();
        assert!(matches!(err, Error::DuplicateTool(name) if name == "render_chart"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_name_rejected() {
        let registry = ToolRegistry::new();
        let err = registry.resolve("nonexistent").err().unwrap();
        assert!(matches!(err, Error::UnknownTool(name) if name == "nonexistent"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(stub("zeta")).unwrap();
        registry.register(stub("alpha")).unwrap();
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }
}
