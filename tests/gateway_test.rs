//! Integration tests for the gateway's public surface:
//! - dialogue ordering and the system-prompt law
//! - tool dispatch semantics (actions, malformed arguments)
//! - wake-greeting cache behavior
//! - configuration normalization (auth key, endpoint rewrite, exit commands)
//! - sentence segmentation feeding the TTS stage
//! - provider capability contracts against mocked backends

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use voxgate::config::{Config, ExitMatch};
use voxgate::connection::wakeup::{filter_punctuation, WakeupCache};
use voxgate::dialogue::{Dialogue, Message, Role, ToolCall};
use voxgate::providers::{FunctionDescriptor, Memory, Vision};
use voxgate::tools::builtin::FunctionRegistry;
use voxgate::tools::{Action, FunctionCallData, ToolContext, ToolDispatcher, ToolResult};
use voxgate::voice::tts_stream::split_sentences;

// =====================================================================
// DIALOGUE
// =====================================================================

#[test]
fn test_system_prompt_law() {
    // Set system prompt ⇒ get dialogue ⇒ first element is that prompt.
    let mut dialogue = Dialogue::new();
    dialogue.put(Message::user("hello"));
    dialogue.update_system_message("be brief");

    let first = &dialogue.messages()[0];
    assert_eq!(first.role, Role::System);
    assert_eq!(first.content.as_deref(), Some("be brief"));

    // At most one system message, always first.
    dialogue.update_system_message("be very brief");
    let system_count = dialogue
        .messages()
        .iter()
        .filter(|m| m.role == Role::System)
        .count();
    assert_eq!(system_count, 1);
}

#[test]
fn test_tool_message_adjacency_invariant() {
    let mut dialogue = Dialogue::new();
    dialogue.put(Message::user("weather?"));
    dialogue.put(Message::assistant_with_tools(vec![ToolCall::new(
        "abc",
        "get_weather",
        r#"{"city":"Oslo"}"#,
    )]));
    dialogue.put(Message::tool_result("abc", "rainy"));
    dialogue.put(Message::assistant("It's rainy."));

    for (i, message) in dialogue.messages().iter().enumerate() {
        if message.role == Role::Tool {
            let prev = &dialogue.messages()[i - 1];
            assert_eq!(prev.role, Role::Assistant);
            let ids: Vec<_> = prev
                .tool_calls
                .as_ref()
                .unwrap()
                .iter()
                .map(|c| c.id.as_str())
                .collect();
            assert!(ids.contains(&message.tool_call_id.as_deref().unwrap()));
        }
    }
}

// =====================================================================
// TOOL DISPATCH
// =====================================================================

fn test_ctx() -> ToolContext {
    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    ToolContext {
        session_id: "it-session".to_string(),
        device_id: "it-device".to_string(),
        outbound: tx,
        close_after_chat: Arc::new(AtomicBool::new(false)),
    }
}

#[tokio::test]
async fn test_dispatcher_action_taxonomy() {
    let dispatcher = ToolDispatcher::new();

    let unknown = dispatcher
        .handle_llm_function_call(
            &test_ctx(),
            &FunctionCallData {
                id: "1".to_string(),
                name: "definitely_missing".to_string(),
                arguments: "{}".to_string(),
            },
        )
        .await;
    assert_eq!(unknown.action, Action::NotFound);

    let bad_args = dispatcher
        .handle_llm_function_call(
            &test_ctx(),
            &FunctionCallData {
                id: "2".to_string(),
                name: "get_time".to_string(),
                arguments: "[1,2,3]".to_string(),
            },
        )
        .await;
    assert_eq!(bad_args.action, Action::Error);
    assert!(bad_args.spoken_text().is_some());
}

#[test]
fn test_registry_custom_function_sees_parsed_arguments() {
    let mut registry = FunctionRegistry::new();
    registry.register(
        FunctionDescriptor::new(
            "get_weather",
            "Weather lookup",
            serde_json::json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        ),
        Arc::new(|_ctx, args| {
            let city = args.get("city").and_then(|v| v.as_str()).unwrap_or("?");
            ToolResult::req_llm(format!("Weather in {city}: sunny"))
        }),
    );

    let result = registry
        .invoke(&test_ctx(), "get_weather", &serde_json::json!({"city": "Oslo"}))
        .unwrap();
    assert_eq!(result.action, Action::ReqLlm);
    assert_eq!(result.result.as_deref(), Some("Weather in Oslo: sunny"));
}

// =====================================================================
// WAKE-PHRASE GREETING CACHE
// =====================================================================

#[test]
fn test_wake_greeting_served_identically_within_ttl() {
    // Two consecutive detections within the refresh window resolve to the
    // same cache file, hence byte-identical audio payloads.
    let first = WakeupCache::file_path_for("test-voice");
    let second = WakeupCache::file_path_for("test-voice");
    assert_eq!(first, second);
    assert_ne!(first, WakeupCache::file_path_for("other-voice"));
}

#[test]
fn test_wake_phrase_matching_ignores_punctuation() {
    let config = Config::load_default();
    let phrase = &config.wakeup_words[0];
    let spoken = format!("  {}! ", phrase.to_uppercase());
    assert_eq!(filter_punctuation(&spoken), filter_punctuation(phrase));
}

// =====================================================================
// CONFIGURATION
// =====================================================================

#[test]
fn test_auth_key_generated_when_placeholder() {
    let yaml = "server:\n  auth_key: \"your-secret-here\"\n";
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    config.normalize();
    assert!(!config.server.auth_key.contains("your-"));
    assert!(!config.server.auth_key.is_empty());
}

#[test]
fn test_tool_endpoint_rewrite_and_validation() {
    let mut config = Config::load_default();
    config.mcp_endpoint = Some("wss://hub.example.com/mcp/token123".to_string());
    config.normalize();
    assert_eq!(
        config.mcp_endpoint.as_deref(),
        Some("wss://hub.example.com/call/token123")
    );

    let mut config = Config::load_default();
    config.mcp_endpoint = Some("not a url".to_string());
    config.normalize();
    assert!(config.mcp_endpoint.is_none());
}

#[test]
fn test_exit_command_matching_modes() {
    let mut config = Config::load_default();
    config.exit_commands = vec!["goodbye".to_string()];

    config.exit_match = ExitMatch::Exact;
    assert!(config.is_exit_command("GOODBYE"));
    assert!(!config.is_exit_command("well goodbye then"));

    config.exit_match = ExitMatch::Substring;
    assert!(config.is_exit_command("well goodbye then"));
}

#[test]
fn test_advertised_channel_url() {
    let mut config = Config::load_default();
    config.server.host = "10.0.0.5".to_string();
    config.server.port = 8000;
    assert_eq!(config.advertised_ws_url(), "ws://10.0.0.5:8000/xiaozhi/v1/");

    config.server.websocket = "wss://gateway.example.com/xiaozhi/v1/".to_string();
    assert_eq!(
        config.advertised_ws_url(),
        "wss://gateway.example.com/xiaozhi/v1/"
    );
}

#[test]
fn test_config_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
server:
  port: 9000
  http_port: 9003
close_connection_no_voice_time: 30
exit_commands: ["stop now"]
enable_server_control: true
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.idle_timeout_secs(), 90);
    assert!(config.is_exit_command("stop now"));
    assert!(config.enable_server_control);
}

// =====================================================================
// PROVIDER CONTRACTS (mocked backends)
// =====================================================================

mockall::mock! {
    VisionBackend {}

    #[async_trait::async_trait]
    impl voxgate::providers::Vision for VisionBackend {
        async fn explain(&self, question: &str, image_base64: &str) -> anyhow::Result<String>;
    }
}

#[test]
fn test_vision_capability_against_mock_backend() {
    let mut vision = MockVisionBackend::new();
    vision
        .expect_explain()
        .times(1)
        .returning(|question, _image| Ok(format!("Answering: {question}")));

    let answer = tokio_test::block_on(vision.explain("what is on the desk", "aGVsbG8="));
    assert_eq!(answer.unwrap(), "Answering: what is on the desk");
}

mockall::mock! {
    MemoryBackend {}

    #[async_trait::async_trait]
    impl voxgate::providers::Memory for MemoryBackend {
        async fn query_memory(&self, query: &str) -> anyhow::Result<Option<String>>;
        async fn save_memory(
            &self,
            device_id: &str,
            messages: &[voxgate::dialogue::Message],
        ) -> anyhow::Result<()>;
    }
}

#[test]
fn test_memory_capability_against_mock_backend() {
    let mut memory = MockMemoryBackend::new();
    memory
        .expect_query_memory()
        .returning(|_| Ok(Some("- prefers short answers".to_string())));
    memory
        .expect_save_memory()
        .times(1)
        .returning(|device_id, messages| {
            assert_eq!(device_id, "dev-1");
            assert!(!messages.is_empty());
            Ok(())
        });

    let recalled = tokio_test::block_on(memory.query_memory("anything")).unwrap();
    assert_eq!(recalled.as_deref(), Some("- prefers short answers"));

    let saved = tokio_test::block_on(
        memory.save_memory("dev-1", &[Message::user("remember me")]),
    );
    assert!(saved.is_ok());
}

// =====================================================================
// SENTENCE SEGMENTATION
// =====================================================================

#[test]
fn test_streamed_chunks_assemble_into_sentences() {
    let chunks = ["The wea", "ther is fine. Tomor", "row looks rainy! And"];
    let mut buffer = String::new();
    let mut sentences = Vec::new();
    for chunk in chunks {
        buffer.push_str(chunk);
        sentences.extend(split_sentences(&mut buffer));
    }
    assert_eq!(
        sentences,
        vec!["The weather is fine.", "Tomorrow looks rainy!"]
    );
    assert_eq!(buffer.trim(), "And");
}
