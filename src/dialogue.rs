//! Per-session dialogue store
//!
//! Ordered message log with a single system-prompt slot. Appends are totally
//! ordered per connection; a tool call and its `tool` response are appended
//! adjacently by the chat stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A structured tool call surfaced by the LLM (or synthesized from an inline
/// text marker). Arguments are kept as a JSON string for the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            index: Some(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()), None, None)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()), None, None)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()), None, None)
    }

    /// Assistant message carrying tool calls (content may be empty).
    pub fn assistant_with_tools(tool_calls: Vec<ToolCall>) -> Self {
        Self::new(Role::Assistant, None, Some(tool_calls), None)
    }

    /// Tool response, adjacent to the assistant message that requested it.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Role::Tool,
            Some(content.into()),
            None,
            Some(tool_call_id.into()),
        )
    }

    fn new(
        role: Role,
        content: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
        tool_call_id: Option<String>,
    ) -> Self {
        Self {
            role,
            content,
            tool_calls,
            tool_call_id,
            timestamp: Some(Utc::now()),
        }
    }
}

/// Ordered message log with a single system slot at index 0.
#[derive(Debug, Clone, Default)]
pub struct Dialogue {
    messages: Vec<Message>,
}

impl Dialogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. A system message routes to the system slot instead.
    pub fn put(&mut self, message: Message) {
        if message.role == Role::System {
            self.update_system_message(message.content.unwrap_or_default());
            return;
        }
        self.messages.push(message);
    }

    /// Replace (or install) the system prompt atomically.
    pub fn update_system_message(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.content = Some(prompt);
            }
            _ => self.messages.insert(0, Message::system(prompt)),
        }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .and_then(|m| m.content.as_deref())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages for an LLM request. Retrieved memory is folded into the
    /// system prompt so providers see a plain message list.
    pub fn llm_messages(&self, memory: Option<&str>) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        let mut iter = self.messages.iter();

        match self.messages.first() {
            Some(first) if first.role == Role::System => {
                iter.next();
                let mut content = first.content.clone().unwrap_or_default();
                if let Some(memory) = memory.filter(|m| !m.is_empty()) {
                    content.push_str("\n\nRelevant memory about this user:\n");
                    content.push_str(memory);
                }
                out.push(Message::system(content));
            }
            _ => {
                if let Some(memory) = memory.filter(|m| !m.is_empty()) {
                    out.push(Message::system(format!(
                        "Relevant memory about this user:\n{memory}"
                    )));
                }
            }
        }

        out.extend(iter.cloned());
        out
    }
}
