//! Tool registry - tagged descriptors resolved by name
//!
//! Callers register typed handlers up front; nothing is discovered by
//! reflection. A tool is a name, a parameter schema and an async handler
//! taking JSON args and returning a JSON-serializable result. Tool failures
//! come back as strings so the model can read them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// One callable tool
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the parameters object
    fn schema(&self) -> Value;
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

type HandlerFn = dyn Fn(Value) -> Result<Value, String> + Send + Sync;

/// Tool built from a plain function
pub struct ToolDescriptor {
    name: String,
    description: String,
    schema: Value,
    handler: Arc<HandlerFn>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl Tool for ToolDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        (self.handler)(args)
    }
}

/// Registry of tools resolvable by name
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!(tool_name = tool.name(), "Tool registered");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn register_fn(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        self.register(Arc::new(ToolDescriptor::new(name, description, schema, handler)));
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Tool>)> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// OpenAI-style native schema for one tool
pub fn to_native_schema(tool: &dyn Tool) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name(),
            "description": tool.description(),
            "parameters": tool.schema(),
        }
    })
}

/// Prompt-form tool block appended to system instructions
///
/// The code-fence protocol: the model announces calls as fenced JSON with
/// `tool` and `arguments` keys, the parser picks them out of the reply.
pub fn build_prompt_tool_block(tools: &[Arc<dyn Tool>]) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let mut block = String::from(
        "\n\n## Available Tools\n\nTo call a tool, emit a fenced JSON block:\n\n```json\n{\"tool\": \"<name>\", \"arguments\": { ... }}\n```\n\nOne block per call. Tool results arrive in the next message.\n\n",
    );
    for tool in tools {
        block.push_str(&format!(
            "### {}\n{}\nParameters: {}\n\n",
            tool.name(),
            tool.description(),
            tool.schema()
        ));
    }
    block
}
