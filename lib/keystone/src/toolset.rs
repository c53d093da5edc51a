use crate::dispatch::{Dispatcher, MethodCtx};
use crate::jsonrpc::RpcError;
use serde_json::{json, Value};
use std::rc::Rc;

pub type ToolHandler = Box<dyn Fn(&mut MethodCtx, &Value) -> Result<Value, RpcError>>;

/// One callable tool: a name, a human description, a JSON schema for its
/// arguments, and the handler itself.
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    handler: ToolHandler,
}

/// Tool catalog backing the `tools/list` and `tools/call` methods.
#[derive(Default)]
pub struct ToolSet {
    tools: Vec<Tool>,
}

impl ToolSet {
    pub fn new() -> ToolSet {
        ToolSet { tools: Vec::new() }
    }

    pub fn add<F>(&mut self, name: &str, description: &str, input_schema: Value, handler: F)
    where
        F: Fn(&mut MethodCtx, &Value) -> Result<Value, RpcError> + 'static,
    {
        self.tools.push(Tool {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            handler: Box::new(handler),
        });
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registers `tools/list` and `tools/call` over this catalog.
    pub fn install(self, dispatcher: &mut Dispatcher) {
        let tools = Rc::new(self);
        let catalog = Rc::clone(&tools);

        dispatcher.register("tools/list", move |_, _| {
            Ok(json!({ "tools": catalog.catalog() }))
        });

        dispatcher.register("tools/call", move |ctx, params| {
            let params = params.ok_or_else(|| RpcError::invalid_params("missing params"))?;
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params("missing tool name"))?;
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

            let tool = tools
                .tools
                .iter()
                .find(|tool| tool.name == name)
                .ok_or_else(|| RpcError::invalid_params("unknown tool"))?;

            (tool.handler)(ctx, &arguments)
        });
    }

    fn catalog(&self) -> Value {
        Value::Array(
            self.tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "inputSchema": tool.input_schema,
                    })
                })
                .collect(),
        )
    }
}
