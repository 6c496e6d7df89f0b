//! Text message router
//!
//! Dispatches UTF-8 JSON frames by their `type` discriminator. Two legacy
//! contracts survive from the original firmware: malformed JSON is echoed
//! back verbatim, and a bare JSON integer is echoed back as-is.

use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{chat, wakeup, ConnectionState, Outbound};
use crate::tools::mcp::McpClient;
use crate::voice::pipeline::{AudioEvent, ListenMode};

pub async fn handle_text_message(state: &Arc<ConnectionState>, raw: &str) {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(_) => {
            // Legacy contract: echo unparseable frames back verbatim.
            debug!("Echoing malformed frame ({} bytes)", raw.len());
            let _ = state
                .outbound()
                .send(Outbound::Text(raw.to_string()))
                .await;
            return;
        }
    };

    if parsed.is_number() {
        info!("Received numeric frame: {}", raw);
        let _ = state
            .outbound()
            .send(Outbound::Text(raw.to_string()))
            .await;
        return;
    }

    match parsed.get("type").and_then(|t| t.as_str()) {
        Some("hello") => handle_hello(state, &parsed).await,
        Some("abort") => handle_abort(state).await,
        Some("listen") => handle_listen(state, &parsed).await,
        Some("iot") => handle_iot(state, &parsed).await,
        Some("mcp") => handle_mcp(state, &parsed).await,
        Some("server") => handle_server_control(state, &parsed).await,
        other => {
            warn!("Unknown message type {:?}: {}", other, raw);
        }
    }
}

/// Capture audio params and features, echo the welcome. `features.mcp`
/// spawns the tool-protocol init and list-tools handshakes off the read loop.
async fn handle_hello(state: &Arc<ConnectionState>, msg: &Value) {
    let mut audio_params = msg.get("audio_params").cloned();

    if let Some(params) = &audio_params {
        if let Some(format) = params.get("format").and_then(|f| f.as_str()) {
            info!("Client audio format: {}", format);
            *state.audio_format.lock().unwrap() = format.to_string();
            state.audio_event(AudioEvent::SetFormat(format.to_string()));
        }
    } else {
        audio_params = Some(json!({"format": "opus", "sample_rate": 16000}));
    }

    if let Some(features) = msg.get("features") {
        info!("Client features: {}", features);
        *state.features.lock().unwrap() = Some(features.clone());

        if features.get("mcp").and_then(|v| v.as_bool()).unwrap_or(false) {
            let client = Arc::new(McpClient::new(state.outbound()));
            state.set_mcp_client(client.clone());

            let init_client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = init_client.initialize().await {
                    warn!("Tool protocol init failed: {}", e);
                }
            });
            tokio::spawn(async move {
                if let Err(e) = client.request_tools_list().await {
                    warn!("Tool list request failed: {}", e);
                }
            });
        }
    }

    state
        .send_json(json!({
            "type": "hello",
            "transport": "websocket",
            "session_id": state.session_id,
            "audio_params": audio_params,
        }))
        .await;
}

/// Set the turn-abort flag, clear TTS output, and flush the client out of
/// the speaking state immediately.
async fn handle_abort(state: &Arc<ConnectionState>) {
    info!("Abort requested by client");
    state.client_abort.store(true, Ordering::SeqCst);
    state.client_is_speaking.store(false, Ordering::SeqCst);
    state
        .send_json(json!({
            "type": "tts",
            "state": "stop",
            "sentence_id": state.current_sentence_id(),
        }))
        .await;
}

async fn handle_listen(state: &Arc<ConnectionState>, msg: &Value) {
    if let Some(mode) = msg.get("mode").and_then(|m| m.as_str()) {
        let mode = ListenMode::from_str(mode);
        *state.listen_mode.lock().unwrap() = mode;
        debug!("Listen mode: {:?}", mode);
    }

    match msg.get("state").and_then(|s| s.as_str()) {
        Some("start") => {
            let mode = *state.listen_mode.lock().unwrap();
            state.audio_event(AudioEvent::ListenStart(mode));
        }
        Some("stop") => {
            state.audio_event(AudioEvent::ListenStop);
        }
        Some("detect") => {
            state.audio_event(AudioEvent::Reset);
            if let Some(text) = msg.get("text").and_then(|t| t.as_str()) {
                handle_detect_text(state, text).await;
            }
        }
        other => warn!("Unknown listen state: {:?}", other),
    }
}

/// Wake-phrase path. A configured wake phrase either plays the cached
/// greeting, starts a canned chat, or (greeting disabled) just resets the
/// client's speaking state; any other detect text goes to chat.
async fn handle_detect_text(state: &Arc<ConnectionState>, text: &str) {
    let config = state.config();
    let filtered = wakeup::filter_punctuation(text);
    let is_wakeup = config
        .wakeup_words
        .iter()
        .any(|w| wakeup::filter_punctuation(w) == filtered);

    if is_wakeup && !config.enable_greeting {
        chat::send_stt(state, text).await;
        state
            .send_json(json!({"type": "tts", "state": "stop"}))
            .await;
        state.client_is_speaking.store(false, Ordering::SeqCst);
        return;
    }

    let state = state.clone();
    let text = text.to_string();
    tokio::spawn(async move {
        if is_wakeup {
            if wakeup::check_wakeup_words(&state, &text).await {
                return;
            }
            chat::start_to_chat(&state, "Hello!").await;
        } else {
            chat::start_to_chat(&state, &text).await;
        }
    });
}

async fn handle_iot(state: &Arc<ConnectionState>, msg: &Value) {
    let iot = state.dispatcher.iot();
    if let Some(descriptors) = msg.get("descriptors") {
        let iot = iot.clone();
        let descriptors = descriptors.clone();
        tokio::spawn(async move { iot.handle_descriptors(&descriptors).await });
    }
    if let Some(states) = msg.get("states") {
        let states = states.clone();
        tokio::spawn(async move { iot.handle_states(&states).await });
    }
}

async fn handle_mcp(state: &Arc<ConnectionState>, msg: &Value) {
    let Some(payload) = msg.get("payload") else {
        return;
    };
    let Some(client) = state.mcp_client() else {
        warn!("Tool-protocol payload before hello negotiated mcp");
        return;
    };
    let payload = payload.clone();
    tokio::spawn(async move { client.handle_payload(&payload).await });
}

/// Control-plane messages: shared-secret check, then `update_config` or
/// `restart`. Disabled unless the config opts in.
async fn handle_server_control(state: &Arc<ConnectionState>, msg: &Value) {
    let config = state.config();
    if !config.enable_server_control {
        debug!("Server control message ignored (disabled)");
        return;
    }

    let sent_secret = msg
        .get("content")
        .and_then(|c| c.get("secret"))
        .and_then(|s| s.as_str())
        .unwrap_or("");
    if sent_secret != config.server.auth_key {
        state
            .send_json(json!({
                "type": "server",
                "status": "error",
                "message": "Secret verification failed"
            }))
            .await;
        return;
    }

    match msg.get("action").and_then(|a| a.as_str()) {
        Some("update_config") => {
            let updated = match state.server.upgrade() {
                Some(server) => server.update_config().await.is_ok(),
                None => false,
            };
            if updated {
                state
                    .send_json(json!({
                        "type": "server",
                        "status": "success",
                        "message": "Configuration updated"
                    }))
                    .await;
            } else {
                state
                    .send_json(json!({
                        "type": "server",
                        "status": "error",
                        "message": "Configuration update failed"
                    }))
                    .await;
            }
        }
        Some("restart") => {
            info!("Restart requested over the control plane");
            state
                .send_json(json!({
                    "type": "server",
                    "status": "success",
                    "message": "Server restarting...",
                    "content": {"action": "restart"}
                }))
                .await;
            if let Some(server) = state.server.upgrade() {
                server.restart();
            }
        }
        other => {
            warn!("Unknown server action: {:?}", other);
        }
    }
}
