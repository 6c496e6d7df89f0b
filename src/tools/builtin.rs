//! In-process tool functions
//!
//! A name-keyed registry of handlers that run inside the gateway process.
//! Handlers are synchronous and cheap; anything that needs I/O belongs in a
//! device tool or a provider.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{ToolContext, ToolResult};
use crate::providers::FunctionDescriptor;

pub type ToolHandler = Arc<dyn Fn(&ToolContext, &Value) -> ToolResult + Send + Sync>;

pub struct FunctionRegistry {
    functions: HashMap<String, (FunctionDescriptor, ToolHandler)>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Registry preloaded with the stock functions.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(
            FunctionDescriptor::new(
                "get_time",
                "Get the current date and time. Use when the user asks what time or day it is.",
                json!({"type": "object", "properties": {}}),
            ),
            Arc::new(|_ctx, _args| {
                let now = chrono::Local::now();
                ToolResult::req_llm(format!(
                    "The current time is {} on {}.",
                    now.format("%H:%M"),
                    now.format("%A, %Y-%m-%d")
                ))
            }),
        );

        registry.register(
            FunctionDescriptor::new(
                "exit_conversation",
                "End the conversation when the user says goodbye or asks to stop.",
                json!({
                    "type": "object",
                    "properties": {
                        "farewell": {"type": "string", "description": "Short goodbye to speak"}
                    }
                }),
            ),
            Arc::new(|ctx, args| {
                ctx.close_after_chat.store(true, Ordering::SeqCst);
                let farewell = args
                    .get("farewell")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Goodbye!");
                ToolResult::response(farewell)
            }),
        );

        registry
    }

    pub fn register(&mut self, descriptor: FunctionDescriptor, handler: ToolHandler) {
        self.functions
            .insert(descriptor.function.name.clone(), (descriptor, handler));
    }

    pub fn descriptors(&self) -> Vec<FunctionDescriptor> {
        self.functions.values().map(|(d, _)| d.clone()).collect()
    }

    /// Run a registered function; `None` if the name is not ours.
    pub fn invoke(&self, ctx: &ToolContext, name: &str, args: &Value) -> Option<ToolResult> {
        let (_, handler) = self.functions.get(name)?;
        Some(handler(ctx, args))
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
