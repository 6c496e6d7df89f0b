//! Device-side tool-protocol client
//!
//! When the hello negotiates `features.mcp`, the device exposes tools over
//! the same channel as JSON-RPC payloads wrapped in `{type:"mcp", payload}`
//! frames. This client drives the initialize / tools-list handshake and
//! correlates call responses through a pending map of oneshot senders.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::connection::Outbound;
use crate::providers::FunctionDescriptor;

#[derive(Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub struct McpClient {
    outbound: tokio::sync::mpsc::Sender<Outbound>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    tools: RwLock<Vec<McpTool>>,
}

impl McpClient {
    pub fn new(outbound: tokio::sync::mpsc::Sender<Outbound>) -> Self {
        Self {
            outbound,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            tools: RwLock::new(Vec::new()),
        }
    }

    async fn send_rpc(&self, method: &str, params: Value) -> Result<oneshot::Receiver<Value>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({
            "type": "mcp",
            "payload": {
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }
        });
        if self.outbound.send(Outbound::Json(frame)).await.is_err() {
            self.pending.lock().await.remove(&id);
            bail!("connection closed while sending {}", method);
        }
        Ok(rx)
    }

    async fn send_notification(&self, method: &str) {
        let frame = json!({
            "type": "mcp",
            "payload": {
                "jsonrpc": "2.0",
                "method": method,
            }
        });
        let _ = self.outbound.send(Outbound::Json(frame)).await;
    }

    /// Protocol handshake; runs as a detached task after hello.
    pub async fn initialize(&self) -> Result<()> {
        let rx = self
            .send_rpc(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "voxgate", "version": crate::VERSION},
                }),
            )
            .await?;
        let _ = rx.await.map_err(|_| anyhow!("initialize dropped"))?;
        self.send_notification("notifications/initialized").await;
        info!("Device tool protocol initialized");
        Ok(())
    }

    /// Ask the device for its tool list and cache it.
    pub async fn request_tools_list(&self) -> Result<()> {
        let rx = self.send_rpc("tools/list", json!({})).await?;
        let result = rx.await.map_err(|_| anyhow!("tools/list dropped"))?;

        let mut tools = Vec::new();
        if let Some(list) = result.get("tools").and_then(|t| t.as_array()) {
            for entry in list {
                let Some(name) = entry.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                tools.push(McpTool {
                    name: name.to_string(),
                    description: entry
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    input_schema: entry
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or(json!({"type": "object", "properties": {}})),
                });
            }
        }
        info!("Device reported {} tools", tools.len());
        *self.tools.write().await = tools;
        Ok(())
    }

    /// Route an incoming `mcp` payload from the device.
    pub async fn handle_payload(&self, payload: &Value) {
        if let Some(id) = payload.get("id").and_then(|v| v.as_u64()) {
            if payload.get("result").is_some() || payload.get("error").is_some() {
                let value = payload
                    .get("result")
                    .cloned()
                    .unwrap_or_else(|| json!({"error": payload["error"].clone()}));
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(value);
                } else {
                    debug!("Response for unknown request id {}", id);
                }
                return;
            }
        }
        // Requests from the device (sampling, pings) are out of scope; log.
        debug!("Unhandled device tool-protocol payload: {}", payload);
    }

    pub async fn has_tool(&self, name: &str) -> bool {
        self.tools.read().await.iter().any(|t| t.name == name)
    }

    pub async fn functions(&self) -> Vec<FunctionDescriptor> {
        self.tools
            .read()
            .await
            .iter()
            .map(|t| FunctionDescriptor::new(&t.name, &t.description, t.input_schema.clone()))
            .collect()
    }

    /// Call a device tool and return its text result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String> {
        let rx = self
            .send_rpc("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let result = rx.await.map_err(|_| anyhow!("tool call dropped"))?;

        if let Some(error) = result.get("error") {
            bail!("device tool error: {}", error);
        }
        if result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            bail!("device tool reported failure");
        }

        let text = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| result.to_string());
        Ok(text)
    }

    /// Fail all in-flight calls; used at teardown.
    pub async fn shutdown(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            warn!("Dropping {} in-flight device tool calls", pending.len());
        }
        pending.clear();
    }
}
