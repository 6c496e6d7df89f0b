//! Connection supervisor
//!
//! One `ConnectionHandler` per upgraded channel. It resolves the device
//! identity (header, then query parameters), authenticates, starts the
//! idle-timeout watcher, schedules provider initialization on a background
//! task so the read loop starts immediately, and routes frames until the
//! peer closes, the idle timeout fires, or a fatal error surfaces. Every
//! exit path runs the same idempotent teardown.

pub mod chat;
pub mod router;
pub mod wakeup;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::providers::ProviderSet;
use crate::server::ServerContext;
use crate::tools::{mcp::McpClient, ToolContext, ToolDispatcher};
use crate::voice::codec::decoder_for_format;
use crate::voice::pipeline::{spawn_audio_pipeline, AudioEvent, ListenMode, Utterance, AUDIO_QUEUE_DEPTH};
use crate::voice::tts_stream::{spawn_tts_stage, TtsMessage};

/// Frames queued for the channel sender task.
#[derive(Debug)]
pub enum Outbound {
    Json(Value),
    /// Raw text, used by the legacy echo contract.
    Text(String),
    Binary(Vec<u8>),
}

/// Bounded pool for blocking provider work (inference, remote calls, file
/// I/O) so one slow backend cannot starve the connection's event loop.
pub const WORKER_POOL_WIDTH: usize = 5;

/// Shared per-connection state. Stages hold an `Arc` to this; after the stop
/// signal fires no stage may emit further frames or tokens.
pub struct ConnectionState {
    pub session_id: String,
    pub device_id: String,
    pub client_id: Option<String>,
    pub client_ip: String,

    /// Live view of the server config; turns snapshot it at entry.
    config: Arc<RwLock<Arc<Config>>>,

    pub audio_format: Mutex<String>,
    pub listen_mode: Mutex<ListenMode>,
    pub features: Mutex<Option<Value>>,
    pub dialogue: Mutex<crate::dialogue::Dialogue>,

    pub last_activity_ms: AtomicU64,
    pub client_abort: Arc<AtomicBool>,
    pub client_is_speaking: Arc<AtomicBool>,
    pub close_after_chat: Arc<AtomicBool>,
    /// Device bind state: when set, reporting and tool loading are disabled
    /// but chat still works (the prompt may carry a bind code).
    pub need_bind: AtomicBool,

    pub sentence_id: Mutex<Option<String>>,

    outbound: mpsc::Sender<Outbound>,
    audio_tx: Mutex<Option<mpsc::Sender<AudioEvent>>>,
    tts_tx: Mutex<Option<mpsc::Sender<TtsMessage>>>,
    providers: Mutex<Option<ProviderSet>>,
    pub dispatcher: Arc<ToolDispatcher>,
    mcp: Mutex<Option<Arc<McpClient>>>,

    pub worker_pool: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,

    pub server: Weak<ServerContext>,
}

impl ConnectionState {
    pub fn config(&self) -> Arc<Config> {
        self.config.read().unwrap().clone()
    }

    pub fn touch_activity(&self) {
        self.last_activity_ms
            .store(now_ms(), Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Queue a JSON frame; silently dropped once the connection is stopping.
    pub async fn send_json(&self, value: Value) {
        if self.is_stopped() {
            return;
        }
        let _ = self.outbound.send(Outbound::Json(value)).await;
    }

    pub fn outbound(&self) -> mpsc::Sender<Outbound> {
        self.outbound.clone()
    }

    /// Push an audio event; frames arriving before VAD/ASR are ready are
    /// dropped silently and the connection stays viable.
    pub fn audio_event(&self, event: AudioEvent) {
        let guard = self.audio_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => {
                if tx.try_send(event).is_err() {
                    debug!("Audio queue full, dropping frame");
                }
            }
            None => debug!("Audio pipeline not ready, dropping frame"),
        }
    }

    /// Queue a message for the TTS stage.
    pub async fn enqueue_tts(&self, message: TtsMessage) {
        let tx = self.tts_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(message).await;
        }
    }

    pub fn providers(&self) -> Option<ProviderSet> {
        self.providers.lock().unwrap().clone()
    }

    pub fn mcp_client(&self) -> Option<Arc<McpClient>> {
        self.mcp.lock().unwrap().clone()
    }

    pub fn set_mcp_client(&self, client: Arc<McpClient>) {
        self.dispatcher.set_mcp_client(client.clone());
        *self.mcp.lock().unwrap() = Some(client);
    }

    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            session_id: self.session_id.clone(),
            device_id: self.device_id.clone(),
            outbound: self.outbound.clone(),
            close_after_chat: self.close_after_chat.clone(),
        }
    }

    pub fn current_sentence_id(&self) -> Option<String> {
        self.sentence_id.lock().unwrap().clone()
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Identity resolved before the read loop starts.
pub struct ConnectionParams {
    pub device_id: Option<String>,
    pub client_id: Option<String>,
    pub client_ip: String,
    pub bearer_token: Option<String>,
}

impl ConnectionParams {
    /// Header fallback order: `device-id` header, then query parameters.
    /// The real client address prefers the first `x-real-ip` /
    /// `x-forwarded-for` hop over the socket peer.
    pub fn resolve(
        headers: &axum::http::HeaderMap,
        query: &HashMap<String, String>,
        peer_ip: String,
    ) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        let device_id = header("device-id").or_else(|| query.get("device-id").cloned());
        let client_id = header("client-id").or_else(|| query.get("client-id").cloned());

        let client_ip = header("x-real-ip")
            .or_else(|| header("x-forwarded-for"))
            .map(|raw| raw.split(',').next().unwrap_or("").trim().to_string())
            .filter(|ip| !ip.is_empty())
            .unwrap_or(peer_ip);

        let bearer_token = header("authorization")
            .and_then(|raw| raw.strip_prefix("Bearer ").map(|t| t.to_string()));

        Self {
            device_id,
            client_id,
            client_ip,
            bearer_token,
        }
    }
}

pub struct ConnectionHandler;

impl ConnectionHandler {
    /// Run one connection to completion. Always returns after teardown.
    pub async fn handle(
        socket: WebSocket,
        params: ConnectionParams,
        server: Arc<ServerContext>,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        // Missing identity: plain-text diagnostic, then close.
        let Some(device_id) = params.device_id else {
            warn!("Connection without device-id from {}", params.client_ip);
            let _ = ws_tx
                .send(Message::Text(
                    "Connection established. Provide a device-id header or query parameter to start a session."
                        .to_string()
                        .into(),
                ))
                .await;
            let _ = ws_tx.close().await;
            return;
        };

        // Injected auth policy; rejection closes without further I/O.
        let config = server.config();
        if let Err(e) =
            server
                .auth
                .authenticate(&device_id, params.bearer_token.as_deref(), &config)
        {
            error!("Authentication failed for {}: {}", device_id, e);
            let _ = ws_tx.close().await;
            return;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "{} conn - device={}, session={}",
            params.client_ip, device_id, session_id
        );

        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(256);
        let (stop_tx, _) = watch::channel(false);

        let state = Arc::new(ConnectionState {
            session_id,
            device_id: device_id.clone(),
            client_id: params.client_id,
            client_ip: params.client_ip,
            config: server.config_handle(),
            audio_format: Mutex::new("opus".to_string()),
            listen_mode: Mutex::new(ListenMode::Auto),
            features: Mutex::new(None),
            dialogue: Mutex::new(crate::dialogue::Dialogue::new()),
            last_activity_ms: AtomicU64::new(now_ms()),
            client_abort: Arc::new(AtomicBool::new(false)),
            client_is_speaking: Arc::new(AtomicBool::new(false)),
            close_after_chat: Arc::new(AtomicBool::new(false)),
            need_bind: AtomicBool::new(false),
            sentence_id: Mutex::new(None),
            outbound: outbound_tx,
            audio_tx: Mutex::new(None),
            tts_tx: Mutex::new(None),
            providers: Mutex::new(None),
            dispatcher: Arc::new(ToolDispatcher::new()),
            mcp: Mutex::new(None),
            worker_pool: Arc::new(Semaphore::new(WORKER_POOL_WIDTH)),
            stop_tx,
            closed: AtomicBool::new(false),
            server: Arc::downgrade(&server),
        });

        server.register_connection(&device_id, &state).await;

        // Sender task owns the sink; closes it on exit (idempotent).
        let sender = spawn_sender_task(ws_tx, outbound_rx, state.stop_signal());

        // Idle-timeout watcher.
        let watcher = spawn_timeout_watcher(state.clone());

        // Provider initialization runs off the read loop; binary frames are
        // dropped until it completes.
        let init = tokio::spawn(initialize_components(state.clone(), server.clone()));

        // System prompt is available immediately from config.
        {
            let config = state.config();
            state
                .dialogue
                .lock()
                .unwrap()
                .update_system_message(config.prompt.clone());
        }

        // Read loop.
        let mut stop = state.stop_signal();
        loop {
            let message = tokio::select! {
                _ = stop.changed() => break,
                message = ws_rx.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => {
                    state.touch_activity();
                    router::handle_text_message(&state, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    state.touch_activity();
                    state.audio_event(AudioEvent::Frame(data.to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client disconnected: {}", state.device_id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read error on {}: {}", state.device_id, e);
                    break;
                }
            }
        }

        teardown(&state, &server).await;
        init.abort();
        watcher.abort();
        let _ = sender.await;
    }
}

fn spawn_sender_task(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = stop.changed() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let result = match message {
                Outbound::Json(value) => {
                    ws_tx
                        .send(Message::Text(value.to_string().into()))
                        .await
                }
                Outbound::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                Outbound::Binary(data) => ws_tx.send(Message::Binary(data.into())).await,
            };
            if result.is_err() {
                break;
            }
        }
        // Double-close is tolerated.
        let _ = ws_tx.close().await;
    })
}

fn spawn_timeout_watcher(state: Arc<ConnectionState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stop = state.stop_signal();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {}
            }
            let timeout_ms = state.config().idle_timeout_secs() * 1000;
            let last = state.last_activity_ms.load(Ordering::SeqCst);
            if now_ms().saturating_sub(last) > timeout_ms {
                info!("Connection timeout for {}", state.device_id);
                state.signal_stop();
                break;
            }
        }
        debug!("Timeout watcher exited");
    })
}

/// Build per-connection provider bindings and start the pipeline stages.
/// Failures degrade: a broken TTS falls back to the fixed-clip provider, and
/// audio frames keep being dropped until VAD/ASR are up.
async fn initialize_components(state: Arc<ConnectionState>, server: Arc<ServerContext>) {
    let config = state.config();
    let shared = &server.providers;

    let asr = match server.registry.asr_for_connection(&shared.asr, &config) {
        Ok(asr) => asr,
        Err(e) => {
            error!("ASR init failed for {}: {}", state.device_id, e);
            return;
        }
    };

    let tts = match server.registry.build_tts(&config) {
        Ok(tts) => tts,
        Err(e) => {
            warn!(
                "TTS init failed for {}, falling back to fixed clip: {}",
                state.device_id, e
            );
            Arc::new(crate::providers::tts::DefaultTts::new()) as Arc<dyn crate::providers::Tts>
        }
    };

    let providers = ProviderSet {
        vad: shared.vad.clone(),
        asr,
        llm: shared.llm.clone(),
        tts: tts.clone(),
        memory: shared.memory.clone(),
        intent: shared.intent.clone(),
        vision: shared.vision.clone(),
    };
    *state.providers.lock().unwrap() = Some(providers.clone());

    // TTS stage.
    let (tts_queue_tx, tts_queue_rx) = mpsc::channel(256);
    spawn_tts_stage(
        tts,
        tts_queue_rx,
        state.outbound(),
        state.client_abort.clone(),
        state.client_is_speaking.clone(),
        state.worker_pool.clone(),
        state.stop_signal(),
    );
    *state.tts_tx.lock().unwrap() = Some(tts_queue_tx);

    // Audio pipeline (VAD worker).
    let format = state.audio_format.lock().unwrap().clone();
    let decoder = match decoder_for_format(&format) {
        Ok(decoder) => decoder,
        Err(e) => {
            error!("Decoder init failed for {}: {}", state.device_id, e);
            return;
        }
    };
    let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
    let (utterance_tx, utterance_rx) = mpsc::channel::<Utterance>(4);
    spawn_audio_pipeline(
        state.session_id.clone(),
        providers.vad.clone(),
        decoder,
        audio_rx,
        utterance_tx,
        state.stop_signal(),
    );
    *state.audio_tx.lock().unwrap() = Some(audio_tx);

    // ASR stage: consume utterances sequentially so turns stay ordered.
    spawn_utterance_consumer(state.clone(), utterance_rx);

    info!("Components initialized for {}", state.device_id);
}

fn spawn_utterance_consumer(
    state: Arc<ConnectionState>,
    mut utterances: mpsc::Receiver<Utterance>,
) {
    tokio::spawn(async move {
        let mut stop = state.stop_signal();
        loop {
            let utterance = tokio::select! {
                _ = stop.changed() => break,
                utterance = utterances.recv() => match utterance {
                    Some(utterance) => utterance,
                    None => break,
                },
            };

            let Some(providers) = state.providers() else { continue };
            state.touch_activity();

            let transcript = {
                let _permit = match state.worker_pool.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                providers
                    .asr
                    .transcribe(&utterance.pcm, &utterance.session_id)
                    .await
            };

            match transcript {
                Ok((text, _artifact)) if text.is_empty() => {
                    info!("Empty transcription, ignoring");
                }
                Ok((text, _artifact)) => {
                    // start_to_chat stops the connection itself after a
                    // chat-then-close turn finishes speaking.
                    chat::start_to_chat(&state, &text).await;
                    if state.close_after_chat.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(e) => {
                    error!("ASR error: {}", e);
                    chat::speak_one_sentence(
                        &state,
                        "Sorry, I couldn't catch that. Could you say it again?",
                    )
                    .await;
                }
            }
        }
        debug!("Utterance consumer exited");
    });
}

/// Give the TTS stage a chance to finish the closing turn before a
/// chat-then-close actually closes.
pub(crate) async fn wait_for_speech_end(state: &Arc<ConnectionState>) {
    for _ in 0..300 {
        if !state.client_is_speaking.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

/// Idempotent teardown: stop signal, queue drain, detached memory save,
/// connection-map removal. The channel close happens in the sender task.
async fn teardown(state: &Arc<ConnectionState>, server: &Arc<ServerContext>) {
    if state.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    state.signal_stop();

    if let Some(mcp) = state.mcp_client() {
        mcp.shutdown().await;
    }

    // Memory save runs detached so the close path never blocks on it.
    if let Some(providers) = state.providers() {
        let messages = state.dialogue.lock().unwrap().messages().to_vec();
        let device_id = state.device_id.clone();
        if messages.len() > 1 {
            tokio::spawn(async move {
                if let Err(e) = providers.memory.save_memory(&device_id, &messages).await {
                    warn!("Memory save failed for {}: {}", device_id, e);
                }
            });
        }
    }

    // Shut the worker pool without waiting; blocked acquires error out.
    state.worker_pool.close();

    server
        .unregister_connection(&state.device_id, &state.session_id)
        .await;
    info!("Connection resources released for {}", state.device_id);
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn test_params_prefer_header_device_id() {
        let mut headers = HeaderMap::new();
        headers.insert("device-id", "dev-h".parse().unwrap());
        let mut query = HashMap::new();
        query.insert("device-id".to_string(), "dev-q".to_string());
        let params = ConnectionParams::resolve(&headers, &query, "1.2.3.4".to_string());
        assert_eq!(params.device_id.as_deref(), Some("dev-h"));
    }

    #[test]
    fn test_params_query_fallback() {
        let headers = HeaderMap::new();
        let mut query = HashMap::new();
        query.insert("device-id".to_string(), "dev-q".to_string());
        query.insert("client-id".to_string(), "cli-q".to_string());
        let params = ConnectionParams::resolve(&headers, &query, "1.2.3.4".to_string());
        assert_eq!(params.device_id.as_deref(), Some("dev-q"));
        assert_eq!(params.client_id.as_deref(), Some("cli-q"));
    }

    #[test]
    fn test_params_missing_device_id() {
        let params =
            ConnectionParams::resolve(&HeaderMap::new(), &HashMap::new(), "1.2.3.4".to_string());
        assert!(params.device_id.is_none());
        assert_eq!(params.client_ip, "1.2.3.4");
    }

    #[test]
    fn test_real_ip_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "9.9.9.9, 10.0.0.1".parse().unwrap());
        let params =
            ConnectionParams::resolve(&headers, &HashMap::new(), "1.2.3.4".to_string());
        assert_eq!(params.client_ip, "9.9.9.9");
    }

    #[test]
    fn test_real_ip_prefers_x_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "8.8.8.8".parse().unwrap());
        headers.insert("x-forwarded-for", "9.9.9.9".parse().unwrap());
        let params =
            ConnectionParams::resolve(&headers, &HashMap::new(), "1.2.3.4".to_string());
        assert_eq!(params.client_ip, "8.8.8.8");
    }
}
