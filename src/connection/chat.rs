//! LLM stage and tool loop
//!
//! `chat` owns one assistant turn: it mints the sentence id, brackets the
//! TTS queue with FIRST/LAST, consumes the token stream, splits text into
//! sentences for synthesis, and drives the tool-call loop. Structured tool
//! calls streamed by the provider win over inline `<tool_call>` markers; the
//! inline marker only triggers fallback parsing when it opens the
//! accumulated content. Errors inside a turn are contained here so the next
//! utterance can start a fresh turn.

use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::ConnectionState;
use crate::dialogue::{Message, ToolCall};
use crate::providers::{IntentMode, LlmEvent};
use crate::tools::{Action, FunctionCallData, ToolResult};
use crate::voice::tts_stream::{split_sentences, TtsMessage};

/// REQLLM re-entries deeper than this speak the raw result instead of
/// looping, so a misbehaving tool cannot recurse forever.
const MAX_TOOL_DEPTH: usize = 5;

/// Entry point for recognized text: reflect it to the client, apply exit
/// commands and wake phrases, then run a turn.
pub async fn start_to_chat(state: &Arc<ConnectionState>, text: &str) {
    state.touch_activity();
    let config = state.config();

    if config.is_exit_command(text) {
        info!("Exit command matched: {}", text);
        send_stt(state, text).await;
        state.close_after_chat.store(true, Ordering::SeqCst);
        chat(state, text, false, 0).await;
    } else if !wakeup_served(state, text).await {
        send_stt(state, text).await;
        chat(state, text, false, 0).await;
    }

    // Chat-then-close: let the farewell finish playing, then stop.
    if state.close_after_chat.load(Ordering::SeqCst) {
        super::wait_for_speech_end(state).await;
        state.signal_stop();
    }
}

async fn wakeup_served(state: &Arc<ConnectionState>, text: &str) -> bool {
    super::wakeup::check_wakeup_words(state, text).await
}

/// Reflect recognized text back to the client.
pub async fn send_stt(state: &Arc<ConnectionState>, text: &str) {
    state
        .send_json(json!({"type": "stt", "text": text}))
        .await;
}

/// Speak a single sentence inside the current turn (apologies, tool
/// responses). Mints a turn bracket if no turn is open.
pub async fn speak_one_sentence(state: &Arc<ConnectionState>, text: &str) {
    match state.current_sentence_id() {
        Some(sentence_id) => {
            state
                .enqueue_tts(TtsMessage::middle(&sentence_id, text))
                .await;
        }
        None => {
            let sentence_id = uuid::Uuid::new_v4().simple().to_string();
            *state.sentence_id.lock().unwrap() = Some(sentence_id.clone());
            state.enqueue_tts(TtsMessage::first(&sentence_id)).await;
            state
                .enqueue_tts(TtsMessage::middle(&sentence_id, text))
                .await;
            state.enqueue_tts(TtsMessage::last(&sentence_id)).await;
        }
    }
}

/// Run one turn of the dialogue. `tool_call` marks a REQLLM re-entry whose
/// user message was appended earlier; `depth` tracks re-entries.
pub async fn chat(state: &Arc<ConnectionState>, query: &str, tool_call: bool, depth: usize) {
    info!("Model receives user message (depth {}): {}", depth, query);

    let Some(providers) = state.providers() else {
        warn!("Chat requested before providers are ready");
        return;
    };

    if !tool_call {
        state
            .dialogue
            .lock()
            .unwrap()
            .put(Message::user(query));
    }

    // Fresh turn: mint the sentence id, clear the abort flag, open the bracket.
    if depth == 0 {
        let sentence_id = uuid::Uuid::new_v4().simple().to_string();
        *state.sentence_id.lock().unwrap() = Some(sentence_id.clone());
        state.client_abort.store(false, Ordering::SeqCst);
        state.enqueue_tts(TtsMessage::first(&sentence_id)).await;
    }
    let sentence_id = state
        .current_sentence_id()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    // Tool loading is disabled for unbound devices.
    let functions = if providers.intent.mode() == IntentMode::FunctionCall
        && !state.need_bind.load(Ordering::SeqCst)
    {
        let functions = state.dispatcher.get_functions().await;
        (!functions.is_empty()).then_some(functions)
    } else {
        None
    };

    // Query-conditioned memory, awaited before the stream starts.
    let mut memory = match providers.memory.query_memory(query).await {
        Ok(memory) => memory,
        Err(e) => {
            warn!("Memory query failed: {}", e);
            None
        }
    };
    if let Some(voiceprint) = &state.config().voiceprint_context {
        let combined = match memory.take() {
            Some(memory) => format!("{memory}\n{voiceprint}"),
            None => voiceprint.clone(),
        };
        memory = Some(combined);
    }

    let messages = state
        .dialogue
        .lock()
        .unwrap()
        .llm_messages(memory.as_deref());

    let stream = match &functions {
        Some(functions) => {
            providers
                .llm
                .response_with_functions(&state.session_id, messages, functions.clone())
                .await
        }
        None => providers.llm.response(&state.session_id, messages).await,
    };

    let mut rx = match stream {
        Ok(rx) => rx,
        Err(e) => {
            error!("LLM request failed for {}: {}", query, e);
            state
                .enqueue_tts(TtsMessage::middle(
                    &sentence_id,
                    crate::providers::llm::LLM_ERROR_SENTINEL,
                ))
                .await;
            if depth == 0 {
                state.enqueue_tts(TtsMessage::last(&sentence_id)).await;
            }
            return;
        }
    };

    let mut tool_call_flag = false;
    let mut function_id: Option<String> = None;
    let mut function_name: Option<String> = None;
    let mut function_arguments = String::new();
    let mut content_arguments = String::new();
    let mut response_parts: Vec<String> = Vec::new();
    let mut sentence_buffer = String::new();
    let mut emotion_pending = true;
    let mut aborted = false;

    while let Some(event) = rx.recv().await {
        if state.client_abort.load(Ordering::SeqCst) {
            // The abort handler already flushed the client; do not emit LAST.
            info!("Turn aborted mid-stream");
            aborted = true;
            break;
        }

        match event {
            LlmEvent::ToolCallDelta {
                id,
                name,
                arguments,
            } => {
                tool_call_flag = true;
                if id.is_some() {
                    function_id = id;
                }
                if name.is_some() {
                    function_name = name;
                }
                function_arguments.push_str(&arguments);
            }
            LlmEvent::Content(chunk) => {
                if chunk.is_empty() {
                    continue;
                }
                content_arguments.push_str(&chunk);

                // Inline fallback only when the marker opens the content.
                if !tool_call_flag && content_arguments.starts_with("<tool_call>") {
                    tool_call_flag = true;
                }

                if emotion_pending && !chunk.trim().is_empty() {
                    emotion_pending = false;
                    send_emotion(state, &chunk).await;
                }

                if !tool_call_flag {
                    response_parts.push(chunk.clone());
                    sentence_buffer.push_str(&chunk);
                    for sentence in split_sentences(&mut sentence_buffer) {
                        state
                            .enqueue_tts(TtsMessage::middle(&sentence_id, &sentence))
                            .await;
                    }
                }
            }
        }
    }

    if !aborted && tool_call_flag {
        let call = resolve_tool_call(
            function_id,
            function_name,
            function_arguments,
            &content_arguments,
        );
        match call {
            Some(call) => {
                // Text streamed before the call becomes its own assistant message.
                if !response_parts.is_empty() {
                    let text = response_parts.join("");
                    state
                        .dialogue
                        .lock()
                        .unwrap()
                        .put(Message::assistant(text));
                    response_parts.clear();
                }
                debug!(
                    "Resolved tool call: name={}, id={}, arguments={}",
                    call.name, call.id, call.arguments
                );
                let result = state
                    .dispatcher
                    .handle_llm_function_call(&state.tool_context(), &call)
                    .await;
                handle_function_result(state, result, &call, depth).await;
            }
            None => {
                // Fallback parse failed: the raw content is plain text.
                error!("Inline tool-call parse failed: {}", content_arguments);
                response_parts.push(content_arguments.clone());
            }
        }
    } else if !aborted && !sentence_buffer.trim().is_empty() {
        // Trailing fragment without closing punctuation still gets spoken.
        state
            .enqueue_tts(TtsMessage::middle(&sentence_id, sentence_buffer.trim()))
            .await;
    }

    if !response_parts.is_empty() {
        let text = response_parts.join("");
        state
            .dialogue
            .lock()
            .unwrap()
            .put(Message::assistant(text));
    }

    if depth == 0 && !state.client_abort.load(Ordering::SeqCst) {
        state.enqueue_tts(TtsMessage::last(&sentence_id)).await;
    }
}

/// Build the final call data. Streamed structured calls take precedence;
/// the inline path extracts the first JSON object from the accumulated text
/// and synthesizes an id. `None` means the text should be treated as plain
/// content.
fn resolve_tool_call(
    function_id: Option<String>,
    function_name: Option<String>,
    function_arguments: String,
    content_arguments: &str,
) -> Option<FunctionCallData> {
    if let (Some(id), Some(name)) = (&function_id, &function_name) {
        return Some(FunctionCallData {
            id: id.clone(),
            name: name.clone(),
            arguments: function_arguments,
        });
    }

    let candidate = extract_json_object(content_arguments)?;
    let parsed: serde_json::Value = serde_json::from_str(candidate).ok()?;
    let name = parsed.get("name")?.as_str()?.to_string();
    let arguments = parsed
        .get("arguments")
        .map(|a| {
            if a.is_string() {
                a.as_str().unwrap_or("{}").to_string()
            } else {
                a.to_string()
            }
        })
        .unwrap_or_else(|| "{}".to_string());

    Some(FunctionCallData {
        id: uuid::Uuid::new_v4().simple().to_string(),
        name,
        arguments,
    })
}

/// First balanced JSON object in the text, string-aware.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

async fn handle_function_result(
    state: &Arc<ConnectionState>,
    result: ToolResult,
    call: &FunctionCallData,
    depth: usize,
) {
    match result.action {
        Action::Response => {
            if let Some(text) = result.response {
                speak_one_sentence(state, &text).await;
                state
                    .dialogue
                    .lock()
                    .unwrap()
                    .put(Message::assistant(text));
            }
        }
        Action::ReqLlm => {
            let Some(text) = result.result.filter(|t| !t.is_empty()) else {
                return;
            };
            if depth >= MAX_TOOL_DEPTH {
                warn!("Tool recursion limit reached, speaking raw result");
                speak_one_sentence(state, &text).await;
                state
                    .dialogue
                    .lock()
                    .unwrap()
                    .put(Message::assistant(text));
                return;
            }
            let arguments = if call.arguments.is_empty() {
                "{}".to_string()
            } else {
                call.arguments.clone()
            };
            {
                let mut dialogue = state.dialogue.lock().unwrap();
                dialogue.put(Message::assistant_with_tools(vec![ToolCall::new(
                    &call.id, &call.name, arguments,
                )]));
                dialogue.put(Message::tool_result(&call.id, &text));
            }
            Box::pin(chat(state, &text, true, depth + 1)).await;
        }
        Action::NotFound | Action::Error => {
            if let Some(text) = result.spoken_text().map(|t| t.to_string()) {
                speak_one_sentence(state, &text).await;
                state
                    .dialogue
                    .lock()
                    .unwrap()
                    .put(Message::assistant(text));
            }
        }
        Action::None => {}
    }
}

/// One-shot emotion cue from the first non-empty chunk of a turn.
async fn send_emotion(state: &Arc<ConnectionState>, text: &str) {
    let (emotion, emoji) = infer_emotion(text);
    state
        .send_json(json!({"type": "llm", "emotion": emotion, "text": emoji}))
        .await;
}

/// Keyword-derived emotion; no extra model round-trip.
pub fn infer_emotion(text: &str) -> (&'static str, &'static str) {
    let lower = text.to_lowercase();
    if lower.contains("sorry") || lower.contains("apolog") || lower.contains("unfortunately") {
        ("sad", "😔")
    } else if lower.contains('!') || lower.contains("great") || lower.contains("awesome") {
        ("excited", "😆")
    } else if lower.contains('?') {
        ("thinking", "🤔")
    } else {
        ("happy", "🙂")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"<tool_call>{"name":"X","arguments":{"a":1}}</tool_call>"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"name":"X","arguments":{"a":1}}"#)
        );
    }

    #[test]
    fn test_extract_json_object_with_braces_in_strings() {
        let text = r#"noise {"name":"f","arguments":{"s":"q{u}o"}} tail"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"name":"f","arguments":{"s":"q{u}o"}}"#)
        );
    }

    #[test]
    fn test_extract_json_object_unbalanced() {
        assert_eq!(extract_json_object(r#"{"name": "x""#), None);
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn test_resolve_structured_call_takes_precedence() {
        let call = resolve_tool_call(
            Some("id1".to_string()),
            Some("get_weather".to_string()),
            r#"{"city":"Oslo"}"#.to_string(),
            r#"<tool_call>{"name":"other"}</tool_call>"#,
        )
        .unwrap();
        assert_eq!(call.id, "id1");
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, r#"{"city":"Oslo"}"#);
    }

    #[test]
    fn test_resolve_inline_fallback() {
        let call = resolve_tool_call(
            None,
            None,
            String::new(),
            r#"<tool_call>{"name":"X","arguments":{"a":1}}</tool_call>"#,
        )
        .unwrap();
        assert_eq!(call.name, "X");
        assert_eq!(call.arguments, r#"{"a":1}"#);
        assert!(!call.id.is_empty());
    }

    #[test]
    fn test_resolve_inline_string_arguments() {
        let call = resolve_tool_call(
            None,
            None,
            String::new(),
            r#"<tool_call>{"name":"X","arguments":"{\"a\":1}"}</tool_call>"#,
        )
        .unwrap();
        assert_eq!(call.arguments, r#"{"a":1}"#);
    }

    #[test]
    fn test_resolve_garbage_is_none() {
        assert!(resolve_tool_call(None, None, String::new(), "<tool_call>oops").is_none());
        assert!(resolve_tool_call(None, None, String::new(), r#"{"no_name":1}"#).is_none());
    }

    #[test]
    fn test_infer_emotion() {
        assert_eq!(infer_emotion("I'm sorry about that").0, "sad");
        assert_eq!(infer_emotion("That's great!").0, "excited");
        assert_eq!(infer_emotion("Hmm, what do you mean?").0, "thinking");
        assert_eq!(infer_emotion("The weather is mild today.").0, "happy");
    }

    mod turns {
        use super::super::*;
        use crate::connection::test_support::{collect_tts_states, make_state, ScriptedLlm};
        use crate::dialogue::Role;
        use crate::providers::LlmEvent;
        use std::sync::Arc;

        #[tokio::test]
        async fn test_plain_turn_brackets_and_dialogue() {
            let llm = Arc::new(ScriptedLlm::new(vec![vec![
                LlmEvent::Content("Hello ".to_string()),
                LlmEvent::Content("there. How are you?".to_string()),
            ]]));
            let (state, mut rx) = make_state(llm);

            chat(&state, "hi", false, 0).await;

            let states = collect_tts_states(&mut rx).await;
            assert_eq!(states.first().map(|s| s.as_str()), Some("start"));
            assert_eq!(states.last().map(|s| s.as_str()), Some("stop"));
            assert_eq!(states.iter().filter(|s| *s == "start").count(), 1);
            assert_eq!(states.iter().filter(|s| *s == "stop").count(), 1);

            let dialogue = state.dialogue.lock().unwrap();
            let messages = dialogue.messages();
            assert_eq!(messages[0].role, Role::User);
            assert_eq!(messages[0].content.as_deref(), Some("hi"));
            let last = messages.last().unwrap();
            assert_eq!(last.role, Role::Assistant);
            assert_eq!(
                last.content.as_deref(),
                Some("Hello there. How are you?")
            );
        }

        #[tokio::test]
        async fn test_tool_call_turn_reenters_llm() {
            // First stream: structured tool call; second stream (re-entry):
            // the phrased answer.
            let llm = Arc::new(ScriptedLlm::new(vec![
                vec![LlmEvent::ToolCallDelta {
                    id: Some("call_1".to_string()),
                    name: Some("get_time".to_string()),
                    arguments: "{}".to_string(),
                }],
                vec![LlmEvent::Content("It is almost noon.".to_string())],
            ]));
            let (state, mut rx) = make_state(llm);

            chat(&state, "what time is it", false, 0).await;

            let states = collect_tts_states(&mut rx).await;
            assert_eq!(states.iter().filter(|s| *s == "start").count(), 1);
            assert_eq!(states.iter().filter(|s| *s == "stop").count(), 1);

            let dialogue = state.dialogue.lock().unwrap();
            let messages = dialogue.messages();
            // user, assistant(tool_calls), tool, assistant(answer)
            let tool_idx = messages
                .iter()
                .position(|m| m.role == Role::Tool)
                .expect("tool message present");
            let caller = &messages[tool_idx - 1];
            assert_eq!(caller.role, Role::Assistant);
            assert_eq!(
                caller.tool_calls.as_ref().unwrap()[0].id,
                *messages[tool_idx].tool_call_id.as_ref().unwrap()
            );
            let last = messages.last().unwrap();
            assert_eq!(last.role, Role::Assistant);
            assert!(!last.content.as_deref().unwrap_or("").is_empty());
        }

        #[tokio::test]
        async fn test_abort_mid_stream_keeps_partial_dialogue() {
            let events: Vec<LlmEvent> = (0..50)
                .map(|i| LlmEvent::Content(format!("Sentence number {i}. ")))
                .collect();
            let llm = Arc::new(ScriptedLlm::new(vec![events]));
            let (state, mut rx) = make_state(llm);

            let abort_flag = state.client_abort.clone();
            let abort_task = tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                abort_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            });

            chat(&state, "tell me everything", false, 0).await;
            abort_task.await.unwrap();

            // No LAST was pushed by the turn itself.
            let states = collect_tts_states(&mut rx).await;
            assert_eq!(states.iter().filter(|s| *s == "stop").count(), 0);

            // Whatever streamed before the abort is retained.
            let dialogue = state.dialogue.lock().unwrap();
            let last = dialogue.messages().last().unwrap();
            assert_eq!(last.role, Role::Assistant);
            assert!(last.content.as_deref().unwrap_or("").contains("Sentence"));
        }

        #[tokio::test]
        async fn test_llm_failure_speaks_sentinel_and_closes_turn() {
            struct FailingLlm;
            #[async_trait::async_trait]
            impl crate::providers::Llm for FailingLlm {
                async fn response(
                    &self,
                    _s: &str,
                    _m: Vec<crate::dialogue::Message>,
                ) -> anyhow::Result<tokio::sync::mpsc::Receiver<LlmEvent>> {
                    anyhow::bail!("backend down")
                }
                async fn response_with_functions(
                    &self,
                    _s: &str,
                    _m: Vec<crate::dialogue::Message>,
                    _f: Vec<crate::providers::FunctionDescriptor>,
                ) -> anyhow::Result<tokio::sync::mpsc::Receiver<LlmEvent>> {
                    anyhow::bail!("backend down")
                }
                async fn response_no_stream(&self, _s: &str, _q: &str) -> anyhow::Result<String> {
                    anyhow::bail!("backend down")
                }
            }

            let (state, mut rx) = make_state(Arc::new(FailingLlm));
            chat(&state, "hi", false, 0).await;

            let states = collect_tts_states(&mut rx).await;
            // Turn still closes normally: start, sentinel sentence, stop.
            assert_eq!(states.first().map(|s| s.as_str()), Some("start"));
            assert_eq!(states.last().map(|s| s.as_str()), Some("stop"));
            assert!(states.iter().any(|s| s == "sentence_start"));
        }
    }
}
