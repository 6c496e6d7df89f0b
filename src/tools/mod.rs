//! Unified tool dispatch
//!
//! One dispatcher fronts three backends: in-process registered functions,
//! device-side tool-protocol tools (served over the same channel), and IoT
//! descriptors announced by the device. Selection is by name. Malformed
//! argument JSON never reaches a backend; it comes back as an `Error`
//! action, and cancellation during a call is reported the same way instead
//! of propagating.

pub mod builtin;
pub mod iot;
pub mod mcp;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::providers::FunctionDescriptor;

/// What the LLM loop should do with a tool's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Speak the response text directly.
    Response,
    /// Feed the result back into the LLM at depth+1.
    ReqLlm,
    /// No such tool; speak an apology.
    NotFound,
    /// The call failed; speak an apology.
    Error,
    /// Drop silently.
    None,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub action: Action,
    /// Text to speak (Response / NotFound / Error).
    pub response: Option<String>,
    /// Raw result for LLM re-entry (ReqLlm).
    pub result: Option<String>,
}

impl ToolResult {
    pub fn response(text: impl Into<String>) -> Self {
        Self {
            action: Action::Response,
            response: Some(text.into()),
            result: None,
        }
    }

    pub fn req_llm(result: impl Into<String>) -> Self {
        Self {
            action: Action::ReqLlm,
            response: None,
            result: Some(result.into()),
        }
    }

    pub fn not_found(text: impl Into<String>) -> Self {
        Self {
            action: Action::NotFound,
            response: Some(text.into()),
            result: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            action: Action::Error,
            response: Some(text.into()),
            result: None,
        }
    }

    pub fn none() -> Self {
        Self {
            action: Action::None,
            response: None,
            result: None,
        }
    }

    /// The text an apology/summary path should speak.
    pub fn spoken_text(&self) -> Option<&str> {
        self.response.as_deref().or(self.result.as_deref())
    }
}

/// A resolved tool call: structured from the stream or synthesized from an
/// inline `<tool_call>` block.
#[derive(Debug, Clone)]
pub struct FunctionCallData {
    pub id: String,
    pub name: String,
    /// JSON object, serialized.
    pub arguments: String,
}

/// Connection-scoped context handed to tool handlers.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub device_id: String,
    pub outbound: tokio::sync::mpsc::Sender<crate::connection::Outbound>,
    pub close_after_chat: Arc<std::sync::atomic::AtomicBool>,
}

const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ToolDispatcher {
    builtin: builtin::FunctionRegistry,
    iot: Arc<iot::IotStore>,
    mcp: std::sync::Mutex<Option<Arc<mcp::McpClient>>>,
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self {
            builtin: builtin::FunctionRegistry::with_defaults(),
            iot: Arc::new(iot::IotStore::new()),
            mcp: std::sync::Mutex::new(None),
        }
    }

    pub fn iot(&self) -> Arc<iot::IotStore> {
        self.iot.clone()
    }

    /// Install the device tool-protocol client once the hello negotiates it.
    pub fn set_mcp_client(&self, client: Arc<mcp::McpClient>) {
        *self.mcp.lock().unwrap() = Some(client);
    }

    fn mcp_client(&self) -> Option<Arc<mcp::McpClient>> {
        self.mcp.lock().unwrap().clone()
    }

    /// Descriptor list advertised to the LLM: builtin + IoT + device tools.
    pub async fn get_functions(&self) -> Vec<FunctionDescriptor> {
        let mut functions = self.builtin.descriptors();
        functions.extend(self.iot.functions().await);
        if let Some(mcp) = self.mcp_client() {
            functions.extend(mcp.functions().await);
        }
        functions
    }

    /// Resolve and execute one tool call.
    pub async fn handle_llm_function_call(
        &self,
        ctx: &ToolContext,
        call: &FunctionCallData,
    ) -> ToolResult {
        debug!(
            "Tool call: name={}, id={}, arguments={}",
            call.name, call.id, call.arguments
        );

        let args: Value = if call.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(_) | Err(_) => {
                    warn!("Malformed tool arguments: {}", call.arguments);
                    return ToolResult::error(format!(
                        "I couldn't use the {} tool because its arguments were invalid.",
                        call.name
                    ));
                }
            }
        };

        if let Some(result) = self.builtin.invoke(ctx, &call.name, &args) {
            return result;
        }

        if let Some(result) = self.iot.invoke(ctx, &call.name, &args).await {
            return result;
        }

        if let Some(mcp) = self.mcp_client() {
            if mcp.has_tool(&call.name).await {
                return match tokio::time::timeout(
                    TOOL_CALL_TIMEOUT,
                    mcp.call_tool(&call.name, args),
                )
                .await
                {
                    Ok(Ok(result)) => ToolResult::req_llm(result),
                    Ok(Err(e)) => {
                        warn!("Device tool {} failed: {}", call.name, e);
                        ToolResult::error(format!(
                            "Something went wrong while running {}.",
                            call.name
                        ))
                    }
                    Err(_) => {
                        warn!("Device tool {} timed out", call.name);
                        ToolResult::error(format!("{} took too long to respond.", call.name))
                    }
                };
            }
        }

        ToolResult::not_found(format!("I don't have a tool called {}.", call.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn test_ctx() -> ToolContext {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        ToolContext {
            session_id: "s1".to_string(),
            device_id: "d1".to_string(),
            outbound: tx,
            close_after_chat: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let dispatcher = ToolDispatcher::new();
        let result = dispatcher
            .handle_llm_function_call(
                &test_ctx(),
                &FunctionCallData {
                    id: "1".to_string(),
                    name: "no_such_tool".to_string(),
                    arguments: "{}".to_string(),
                },
            )
            .await;
        assert_eq!(result.action, Action::NotFound);
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_an_error() {
        let dispatcher = ToolDispatcher::new();
        let result = dispatcher
            .handle_llm_function_call(
                &test_ctx(),
                &FunctionCallData {
                    id: "1".to_string(),
                    name: "get_time".to_string(),
                    arguments: "not json".to_string(),
                },
            )
            .await;
        assert_eq!(result.action, Action::Error);
    }

    #[tokio::test]
    async fn test_builtin_resolution() {
        let dispatcher = ToolDispatcher::new();
        let result = dispatcher
            .handle_llm_function_call(
                &test_ctx(),
                &FunctionCallData {
                    id: "1".to_string(),
                    name: "get_time".to_string(),
                    arguments: String::new(),
                },
            )
            .await;
        assert_eq!(result.action, Action::ReqLlm);
        assert!(result.result.is_some());
    }

    #[tokio::test]
    async fn test_descriptor_list_contains_builtins() {
        let dispatcher = ToolDispatcher::new();
        let functions = dispatcher.get_functions().await;
        assert!(functions.iter().any(|f| f.function.name == "get_time"));
    }
}
