//! IoT descriptor handling
//!
//! Devices announce their controllable peripherals as descriptors (lamp,
//! speaker, …) with properties and methods. Each method becomes a callable
//! function for the LLM; invoking one sends an `iot` command frame back to
//! the device. Reported states are cached so the LLM can read them without a
//! device round-trip.

use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ToolContext, ToolResult};
use crate::connection::Outbound;
use crate::providers::FunctionDescriptor;

#[derive(Debug, Clone)]
pub struct IotDescriptor {
    pub name: String,
    pub description: String,
    pub methods: Value,
}

#[derive(Default)]
pub struct IotStore {
    descriptors: RwLock<HashMap<String, IotDescriptor>>,
    /// Latest reported property values per device descriptor.
    states: RwLock<HashMap<String, Value>>,
}

impl IotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a `descriptors` payload from an `iot` message.
    pub async fn handle_descriptors(&self, payload: &Value) {
        let Some(list) = payload.as_array() else {
            warn!("IoT descriptors payload is not an array");
            return;
        };
        let mut descriptors = self.descriptors.write().await;
        for entry in list {
            let Some(name) = entry.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let descriptor = IotDescriptor {
                name: name.to_string(),
                description: entry
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                methods: entry.get("methods").cloned().unwrap_or(json!({})),
            };
            info!("IoT descriptor registered: {}", name);
            descriptors.insert(name.to_string(), descriptor);
        }
    }

    /// Ingest a `states` payload: cache reported property values.
    pub async fn handle_states(&self, payload: &Value) {
        let Some(list) = payload.as_array() else {
            warn!("IoT states payload is not an array");
            return;
        };
        let mut states = self.states.write().await;
        for entry in list {
            if let Some(name) = entry.get("name").and_then(|v| v.as_str()) {
                states.insert(
                    name.to_string(),
                    entry.get("state").cloned().unwrap_or(Value::Null),
                );
                debug!("IoT state updated: {}", name);
            }
        }
    }

    pub async fn state_of(&self, name: &str) -> Option<Value> {
        self.states.read().await.get(name).cloned()
    }

    /// One callable function per descriptor method, named `device_method`.
    pub async fn functions(&self) -> Vec<FunctionDescriptor> {
        let descriptors = self.descriptors.read().await;
        let mut functions = Vec::new();
        for descriptor in descriptors.values() {
            let Some(methods) = descriptor.methods.as_object() else {
                continue;
            };
            for (method, spec) in methods {
                let description = spec
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&descriptor.description);
                let parameters = spec.get("parameters").cloned().unwrap_or(json!({
                    "type": "object",
                    "properties": {}
                }));
                functions.push(FunctionDescriptor::new(
                    &format!("{}_{}", descriptor.name.to_lowercase(), method.to_lowercase()),
                    &format!("{} ({})", description, descriptor.name),
                    parameters,
                ));
            }
        }
        functions
    }

    /// Execute an IoT function by sending the command frame to the device.
    /// `None` when the name does not map to a known descriptor method.
    pub async fn invoke(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: &Value,
    ) -> Option<ToolResult> {
        let descriptors = self.descriptors.read().await;
        let (descriptor, method) = descriptors.values().find_map(|d| {
            let prefix = format!("{}_", d.name.to_lowercase());
            let method = name.strip_prefix(&prefix)?;
            let methods = d.methods.as_object()?;
            methods
                .keys()
                .find(|m| m.to_lowercase() == method)
                .map(|m| (d.clone(), m.clone()))
        })?;
        drop(descriptors);

        let command = json!({
            "type": "iot",
            "commands": [{
                "name": descriptor.name,
                "method": method,
                "parameters": args,
            }]
        });

        if ctx.outbound.send(Outbound::Json(command)).await.is_err() {
            return Some(ToolResult::error(format!(
                "I couldn't reach the device to control {}.",
                descriptor.name
            )));
        }

        Some(ToolResult::req_llm(format!(
            "Command {} sent to {} successfully.",
            method, descriptor.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn descriptors_payload() -> Value {
        json!([{
            "name": "Lamp",
            "description": "Desk lamp",
            "methods": {
                "TurnOn": {"description": "Turn the lamp on", "parameters": {"type": "object", "properties": {}}},
                "SetBrightness": {"description": "Set brightness", "parameters": {"type": "object", "properties": {"level": {"type": "integer"}}}}
            }
        }])
    }

    fn test_ctx() -> (ToolContext, tokio::sync::mpsc::Receiver<Outbound>) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        (
            ToolContext {
                session_id: "s1".to_string(),
                device_id: "d1".to_string(),
                outbound: tx,
                close_after_chat: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_descriptors_become_functions() {
        let store = IotStore::new();
        store.handle_descriptors(&descriptors_payload()).await;
        let functions = store.functions().await;
        let names: Vec<_> = functions.iter().map(|f| f.function.name.as_str()).collect();
        assert!(names.contains(&"lamp_turnon"));
        assert!(names.contains(&"lamp_setbrightness"));
    }

    #[tokio::test]
    async fn test_invoke_sends_command_frame() {
        let store = IotStore::new();
        store.handle_descriptors(&descriptors_payload()).await;
        let (ctx, mut rx) = test_ctx();

        let result = store
            .invoke(&ctx, "lamp_turnon", &json!({}))
            .await
            .unwrap();
        assert_eq!(result.action, super::super::Action::ReqLlm);

        match rx.recv().await.unwrap() {
            Outbound::Json(v) => {
                assert_eq!(v["type"], "iot");
                assert_eq!(v["commands"][0]["name"], "Lamp");
                assert_eq!(v["commands"][0]["method"], "TurnOn");
            }
            _ => panic!("expected json command"),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_none() {
        let store = IotStore::new();
        store.handle_descriptors(&descriptors_payload()).await;
        let (ctx, _rx) = test_ctx();
        assert!(store.invoke(&ctx, "lamp_explode", &json!({})).await.is_none());
        assert!(store.invoke(&ctx, "fan_turnon", &json!({})).await.is_none());
    }

    #[tokio::test]
    async fn test_states_cached() {
        let store = IotStore::new();
        store
            .handle_states(&json!([{"name": "Lamp", "state": {"on": true}}]))
            .await;
        assert_eq!(store.state_of("Lamp").await.unwrap()["on"], true);
    }
}
