//! Gateway configuration
//!
//! Loads the YAML config file, fills defaults, and normalizes derived
//! settings (generated auth key, tool-endpoint rewrite).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listener addresses and shared secrets
    #[serde(default)]
    pub server: ServerConfig,
    /// Which provider implementation serves each capability
    #[serde(default)]
    pub selected_module: SelectedModules,
    /// Per-provider settings, keyed by the names in `selected_module`
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// System prompt handed to the LLM
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Seconds of silence before the idle close kicks in (watcher adds 60s)
    #[serde(default = "default_no_voice_time")]
    pub close_connection_no_voice_time: u64,
    /// Utterances that end the conversation
    #[serde(default = "default_exit_commands")]
    pub exit_commands: Vec<String>,
    /// How exit commands are matched against transcripts
    #[serde(default)]
    pub exit_match: ExitMatch,
    /// Wake phrases served from the greeting cache
    #[serde(default = "default_wakeup_words")]
    pub wakeup_words: Vec<String>,
    /// Speak a greeting when a wake phrase is detected
    #[serde(default = "default_true")]
    pub enable_greeting: bool,
    /// Serve wake greetings from the on-disk cache
    #[serde(default)]
    pub enable_wakeup_words_response_cache: bool,
    /// Device tool-protocol endpoint (validated; `/mcp/` is rewritten to `/call/`)
    #[serde(default)]
    pub mcp_endpoint: Option<String>,
    /// Keep WAV artifacts of recognized utterances under the data dir
    #[serde(default)]
    pub retain_audio: bool,
    /// Extra speaker context appended to the model input when configured
    #[serde(default)]
    pub voiceprint_context: Option<String>,
    /// Accept `server` control messages (update_config / restart)
    #[serde(default)]
    pub enable_server_control: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket channel port
    #[serde(default = "default_ws_port")]
    pub port: u16,
    /// HTTP bootstrap/vision port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// Channel path prefix; the endpoint is `/<prefix>/v1/`
    #[serde(default = "default_ws_prefix")]
    pub ws_prefix: String,
    /// Advertised websocket URL for the OTA reply; empty means derive from host/port
    #[serde(default)]
    pub websocket: String,
    /// Shared secret: control-plane check and JWT signing for the vision endpoint.
    /// Generated at startup when empty or left at a placeholder.
    #[serde(default)]
    pub auth_key: String,
    /// Offset reported in OTA `server_time` (hours)
    #[serde(default = "default_tz_offset")]
    pub timezone_offset: i32,
    /// Device authentication policy
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_ws_port(),
            http_port: default_http_port(),
            host: default_host(),
            ws_prefix: default_ws_prefix(),
            websocket: String::new(),
            auth_key: String::new(),
            timezone_offset: default_tz_offset(),
            auth: AuthConfig::default(),
        }
    }
}

/// Device authentication policy applied at channel upgrade
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Reject connections that fail the policy; disabled means allow-all
    #[serde(default)]
    pub enabled: bool,
    /// Bearer tokens accepted in the `authorization` header
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Device ids allowed without a token
    #[serde(default)]
    pub allowed_devices: Vec<String>,
}

/// Provider implementation names, one per capability slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedModules {
    #[serde(default = "default_vad")]
    pub vad: String,
    #[serde(default = "default_asr")]
    pub asr: String,
    #[serde(default = "default_llm")]
    pub llm: String,
    #[serde(default = "default_tts")]
    pub tts: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_intent")]
    pub intent: String,
    #[serde(default)]
    pub vllm: Option<String>,
}

impl Default for SelectedModules {
    fn default() -> Self {
        Self {
            vad: default_vad(),
            asr: default_asr(),
            llm: default_llm(),
            tts: default_tts(),
            memory: default_memory(),
            intent: default_intent(),
            vllm: None,
        }
    }
}

/// Settings for one provider instance
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub voice: String,
    /// Extra free-form settings a provider may read
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

/// Exit-command matching semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExitMatch {
    #[default]
    Exact,
    Substring,
}

fn default_ws_port() -> u16 { 8000 }
fn default_http_port() -> u16 { 8003 }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_ws_prefix() -> String { "xiaozhi".to_string() }
fn default_tz_offset() -> i32 { 8 }
fn default_no_voice_time() -> u64 { 120 }
fn default_true() -> bool { true }
fn default_prompt() -> String {
    "You are a friendly voice assistant. Keep replies short and conversational.".to_string()
}
fn default_exit_commands() -> Vec<String> {
    vec!["goodbye".to_string(), "exit".to_string(), "quit".to_string()]
}
fn default_wakeup_words() -> Vec<String> {
    vec!["hey assistant".to_string(), "hello assistant".to_string()]
}
fn default_vad() -> String { "energy".to_string() }
fn default_asr() -> String { "whisper_http".to_string() }
fn default_llm() -> String { "openai_compatible".to_string() }
fn default_tts() -> String { "speech_http".to_string() }
fn default_memory() -> String { "nomem".to_string() }
fn default_intent() -> String { "function_call".to_string() }

impl Config {
    /// Load configuration from a YAML file, then normalize derived settings.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;
        config.normalize();
        Ok(config)
    }

    /// Defaults-only configuration, normalized.
    pub fn load_default() -> Self {
        let mut config = Config::default();
        config.normalize();
        config
    }

    /// Fill in generated values and rewrite the tool endpoint.
    pub fn normalize(&mut self) {
        if self.server.auth_key.is_empty() || self.server.auth_key.contains("your-") {
            self.server.auth_key = uuid::Uuid::new_v4().simple().to_string();
        }
        if let Some(endpoint) = self.mcp_endpoint.take() {
            self.mcp_endpoint = normalize_mcp_endpoint(&endpoint);
        }
    }

    /// Idle timeout for the per-connection watcher.
    pub fn idle_timeout_secs(&self) -> u64 {
        self.close_connection_no_voice_time + 60
    }

    /// Provider settings for a capability slot, by provider name.
    pub fn provider(&self, name: &str) -> ProviderConfig {
        self.providers.get(name).cloned().unwrap_or_default()
    }

    /// The websocket URL advertised to devices during bootstrap.
    pub fn advertised_ws_url(&self) -> String {
        if !self.server.websocket.is_empty() && !self.server.websocket.contains("your-") {
            return self.server.websocket.clone();
        }
        format!(
            "ws://{}:{}{}",
            self.server.host,
            self.server.port,
            self.ws_path()
        )
    }

    /// Channel endpoint path.
    pub fn ws_path(&self) -> String {
        format!("/{}/v1/", self.server.ws_prefix)
    }

    /// Check a transcript against the configured exit commands.
    pub fn is_exit_command(&self, text: &str) -> bool {
        let normalized = text.trim().to_lowercase();
        match self.exit_match {
            ExitMatch::Exact => self
                .exit_commands
                .iter()
                .any(|cmd| cmd.to_lowercase() == normalized),
            ExitMatch::Substring => self
                .exit_commands
                .iter()
                .any(|cmd| normalized.contains(&cmd.to_lowercase())),
        }
    }
}

/// Validate a device tool-protocol endpoint and rewrite its entry path to the
/// call path. Invalid endpoints are dropped rather than propagated.
fn normalize_mcp_endpoint(endpoint: &str) -> Option<String> {
    if endpoint.contains("your-") {
        return None;
    }
    let parsed = url::Url::parse(endpoint).ok()?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        tracing::error!("Tool endpoint must be a ws:// or wss:// URL: {}", endpoint);
        return None;
    }
    Some(endpoint.replace("/mcp/", "/call/"))
}
