//! OpenAI-compatible streaming LLM client
//!
//! Works against any `/chat/completions` endpoint (Ollama, vLLM, hosted
//! gateways). Streams are parsed from SSE by hand over `bytes_stream`;
//! structured tool-call deltas are forwarded as they arrive. Reasoning
//! models that leak `<think>` spans have them stripped before the text
//! reaches sentence assembly.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{FunctionDescriptor, Llm, LlmEvent};
use crate::config::Config;
use crate::dialogue::Message;

/// Spoken when the model stream drops mid-turn; the turn still closes normally.
pub const LLM_ERROR_SENTINEL: &str = "Sorry, I'm having trouble thinking right now.";

pub struct OpenAiCompatibleLlm {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<FunctionDescriptor>>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    /// Arguments may arrive as a JSON string or a raw object depending on
    /// the backend; normalize to a string.
    #[serde(default, deserialize_with = "deserialize_arguments")]
    arguments: String,
}

fn deserialize_arguments<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleLlm {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        let mut base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.ends_with("/v1") {
            base_url.push_str("/v1");
        }
        Self {
            client: Arc::new(Client::new()),
            base_url,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let provider = config.provider(&config.selected_module.llm);
        let base_url = if provider.base_url.is_empty() {
            "http://localhost:11434/v1"
        } else {
            &provider.base_url
        };
        Self::new(base_url, &provider.api_key, &provider.model)
    }

    async fn send_stream(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        tools: Option<Vec<FunctionDescriptor>>,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        debug!(
            "LLM request for session {}: {} messages, tools={}",
            session_id,
            messages.len(),
            tools.as_ref().map(|t| t.len()).unwrap_or(0)
        );

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            tools,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url));
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM backend")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, body);
        }

        let (tx, rx) = mpsc::channel(64);
        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut think = ThinkFilter::new();

            'read: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!("LLM stream error for session {}: {}", session, e);
                        let _ = tx.send(LlmEvent::Content(LLM_ERROR_SENTINEL.to_string())).await;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer = buffer[pos + 1..].to_string();

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'read;
                    }
                    let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) else {
                        warn!("Unparseable stream chunk: {}", data);
                        continue;
                    };
                    let Some(choice) = parsed.choices.first() else {
                        continue;
                    };

                    if let Some(calls) = &choice.delta.tool_calls {
                        for call in calls {
                            let event = LlmEvent::ToolCallDelta {
                                id: call.id.clone(),
                                name: call.function.as_ref().and_then(|f| f.name.clone()),
                                arguments: call
                                    .function
                                    .as_ref()
                                    .map(|f| f.arguments.clone())
                                    .unwrap_or_default(),
                            };
                            if tx.send(event).await.is_err() {
                                break 'read;
                            }
                        }
                    }

                    if let Some(content) = &choice.delta.content {
                        let visible = think.push(content);
                        if !visible.is_empty()
                            && tx.send(LlmEvent::Content(visible)).await.is_err()
                        {
                            break 'read;
                        }
                    }

                    if choice.finish_reason.is_some() {
                        break 'read;
                    }
                }
            }

            let tail = think.flush();
            if !tail.is_empty() {
                let _ = tx.send(LlmEvent::Content(tail)).await;
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl Llm for OpenAiCompatibleLlm {
    async fn response(
        &self,
        session_id: &str,
        messages: Vec<Message>,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        self.send_stream(session_id, messages, None).await
    }

    async fn response_with_functions(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        functions: Vec<FunctionDescriptor>,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        self.send_stream(session_id, messages, Some(functions)).await
    }

    async fn response_no_stream(&self, system_prompt: &str, question: &str) -> Result<String> {
        let messages = vec![Message::system(system_prompt), Message::user(question)];
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: false,
            tools: None,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url));
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM backend")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, body);
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let mut think = ThinkFilter::new();
        let mut visible = think.push(&content);
        visible.push_str(&think.flush());
        Ok(visible.trim().to_string())
    }
}

/// Strips `<think>…</think>` spans from streamed text, including spans and
/// tag markers that straddle chunk boundaries.
struct ThinkFilter {
    pending: String,
    in_think: bool,
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

impl ThinkFilter {
    fn new() -> Self {
        Self {
            pending: String::new(),
            in_think: false,
        }
    }

    /// Feed a chunk, get back the text that is safe to emit.
    fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut out = String::new();

        loop {
            if self.in_think {
                match self.pending.find(THINK_CLOSE) {
                    Some(pos) => {
                        self.pending.drain(..pos + THINK_CLOSE.len());
                        self.in_think = false;
                    }
                    None => {
                        // Keep only a possible partial close tag.
                        let keep = partial_suffix_len(&self.pending, THINK_CLOSE);
                        let cut = self.pending.len() - keep;
                        self.pending.drain(..cut);
                        return out;
                    }
                }
            } else {
                match self.pending.find(THINK_OPEN) {
                    Some(pos) => {
                        out.push_str(&self.pending[..pos]);
                        self.pending.drain(..pos + THINK_OPEN.len());
                        self.in_think = true;
                    }
                    None => {
                        let keep = partial_suffix_len(&self.pending, THINK_OPEN);
                        let cut = self.pending.len() - keep;
                        out.push_str(&self.pending[..cut]);
                        self.pending.drain(..cut);
                        return out;
                    }
                }
            }
        }
    }

    /// Emit whatever is still held back at end of stream.
    fn flush(&mut self) -> String {
        if self.in_think {
            self.pending.clear();
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        if text.is_char_boundary(text.len() - len) && tag.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_think_filter_passthrough() {
        let mut filter = ThinkFilter::new();
        assert_eq!(filter.push("hello "), "hello ");
        assert_eq!(filter.push("world"), "world");
        assert_eq!(filter.flush(), "");
    }

    #[test]
    fn test_think_filter_strips_span() {
        let mut filter = ThinkFilter::new();
        let out = filter.push("a<think>secret</think>b");
        assert_eq!(out, "ab");
    }

    #[test]
    fn test_think_filter_split_across_chunks() {
        let mut filter = ThinkFilter::new();
        let mut out = String::new();
        out.push_str(&filter.push("hi <thi"));
        out.push_str(&filter.push("nk>hidden</th"));
        out.push_str(&filter.push("ink> there"));
        out.push_str(&filter.flush());
        assert_eq!(out, "hi  there");
    }

    #[test]
    fn test_think_filter_unclosed_span_drops_tail() {
        let mut filter = ThinkFilter::new();
        let out = filter.push("visible<think>never closed");
        assert_eq!(out, "visible");
        assert_eq!(filter.flush(), "");
    }

    #[test]
    fn test_partial_suffix_len() {
        assert_eq!(partial_suffix_len("abc<th", "<think>"), 3);
        assert_eq!(partial_suffix_len("abc", "<think>"), 0);
        assert_eq!(partial_suffix_len("<", "<think>"), 1);
    }

    #[test]
    fn test_base_url_gets_v1_suffix() {
        let llm = OpenAiCompatibleLlm::new("http://localhost:11434", "", "qwen3");
        assert_eq!(llm.base_url, "http://localhost:11434/v1");
        let llm = OpenAiCompatibleLlm::new("http://localhost:11434/v1/", "", "qwen3");
        assert_eq!(llm.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_arguments_accept_object_or_string() {
        let delta: WireFunctionDelta =
            serde_json::from_str(r#"{"name":"f","arguments":{"a":1}}"#).unwrap();
        assert_eq!(delta.arguments, r#"{"a":1}"#);
        let delta: WireFunctionDelta =
            serde_json::from_str(r#"{"name":"f","arguments":"{\"a\":1}"}"#).unwrap();
        assert_eq!(delta.arguments, r#"{"a":1}"#);
    }
}
