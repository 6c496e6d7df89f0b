//! Provider capability contracts
//!
//! Each capability (VAD, ASR, LLM, TTS, memory, intent, vision) is a trait;
//! concrete adapters live in the submodules. A name-keyed registry maps the
//! `selected_module` config to constructors. LOCAL providers are shared
//! across connections; remote providers are built once per connection
//! because they hold per-connection sockets or sessions.

pub mod asr;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod tts;
pub mod vision;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::dialogue::Message;

/// Whether a provider instance may be shared across connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    /// In-process; internally thread-safe; one instance serves all connections.
    Local,
    /// Holds per-connection state (sockets, sessions); one instance per connection.
    Remote,
}

/// Voice activity verdict for a single decoded frame. Per-connection
/// windowing and utterance segmentation live in `voice::pipeline`.
pub trait Vad: Send + Sync {
    fn is_voice(&self, frame: &[i16]) -> bool;
}

/// Speech recognition.
#[async_trait]
pub trait Asr: Send + Sync {
    fn interface_type(&self) -> InterfaceType;

    /// Transcribe a complete utterance. Returns the text and, when artifact
    /// retention is on, the path of the WAV written for diagnostics.
    async fn transcribe(
        &self,
        pcm: &[i16],
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>)>;
}

/// One event from a streaming LLM response.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// A text chunk. Provider errors arrive as a sentinel text chunk so the
    /// turn closes normally with a spoken message.
    Content(String),
    /// A structured tool-call delta; fields accumulate across deltas.
    ToolCallDelta {
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

/// Function descriptor advertised to the LLM (OpenAI tools format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl FunctionDescriptor {
    pub fn new(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSchema {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// Streaming dialogue model. Each call creates a fresh stream; streams are
/// not restartable.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Plain streamed response.
    async fn response(
        &self,
        session_id: &str,
        messages: Vec<Message>,
    ) -> Result<mpsc::Receiver<LlmEvent>>;

    /// Streamed response with tool definitions attached.
    async fn response_with_functions(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        functions: Vec<FunctionDescriptor>,
    ) -> Result<mpsc::Receiver<LlmEvent>>;

    /// One-shot non-streamed completion (greeting regeneration, summaries).
    async fn response_no_stream(&self, system_prompt: &str, question: &str) -> Result<String>;
}

/// Synthesized audio for one sentence.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    /// Encoded audio in the connection's negotiated output format.
    pub data: Vec<u8>,
    /// Playback duration when the provider reports it; drives client UI cues.
    pub duration_ms: Option<u64>,
}

/// Speech synthesis.
#[async_trait]
pub trait Tts: Send + Sync {
    fn voice(&self) -> &str;
    async fn synthesize(&self, text: &str) -> Result<TtsAudio>;
}

/// Per-device retrievable context.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Query-conditioned retrieval; `None` when nothing relevant is stored.
    async fn query_memory(&self, query: &str) -> Result<Option<String>>;
    /// Persist the dialogue; runs detached from the close path.
    async fn save_memory(&self, device_id: &str, messages: &[Message]) -> Result<()>;
}

/// How user intent maps to LLM invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentMode {
    /// Advertise functions and let the model emit tool calls.
    FunctionCall,
    /// Plain chat; no tool loop.
    NoIntent,
}

pub trait Intent: Send + Sync {
    fn mode(&self) -> IntentMode;
}

/// Vision analysis for the HTTP explain endpoint.
#[async_trait]
pub trait Vision: Send + Sync {
    async fn explain(&self, question: &str, image_base64: &str) -> Result<String>;
}

/// Provider bindings for one connection (or the shared singletons).
#[derive(Clone)]
pub struct ProviderSet {
    pub vad: Arc<dyn Vad>,
    pub asr: Arc<dyn Asr>,
    pub llm: Arc<dyn Llm>,
    pub tts: Arc<dyn Tts>,
    pub memory: Arc<dyn Memory>,
    pub intent: Arc<dyn Intent>,
    pub vision: Option<Arc<dyn Vision>>,
}

type AsrCtor = fn(&Config) -> Result<Arc<dyn Asr>>;
type LlmCtor = fn(&Config) -> Result<Arc<dyn Llm>>;
type TtsCtor = fn(&Config) -> Result<Arc<dyn Tts>>;

/// Name-keyed constructors for the capability slots. Absent capabilities
/// (e.g. no vision model selected) become `None` in the provider set.
pub struct ProviderRegistry {
    asr: HashMap<String, AsrCtor>,
    llm: HashMap<String, LlmCtor>,
    tts: HashMap<String, TtsCtor>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            asr: HashMap::new(),
            llm: HashMap::new(),
            tts: HashMap::new(),
        };
        registry.register_asr("whisper_http", |config| {
            Ok(Arc::new(asr::WhisperHttpAsr::from_config(config)) as Arc<dyn Asr>)
        });
        registry.register_llm("openai_compatible", |config| {
            Ok(Arc::new(llm::OpenAiCompatibleLlm::from_config(config)) as Arc<dyn Llm>)
        });
        registry.register_tts("speech_http", |config| {
            Ok(Arc::new(tts::SpeechHttpTts::from_config(config)) as Arc<dyn Tts>)
        });
        registry.register_tts("default", |_| {
            Ok(Arc::new(tts::DefaultTts::new()) as Arc<dyn Tts>)
        });
        registry
    }
}

impl ProviderRegistry {
    pub fn register_asr(&mut self, name: &str, ctor: AsrCtor) {
        self.asr.insert(name.to_string(), ctor);
    }

    pub fn register_llm(&mut self, name: &str, ctor: LlmCtor) {
        self.llm.insert(name.to_string(), ctor);
    }

    pub fn register_tts(&mut self, name: &str, ctor: TtsCtor) {
        self.tts.insert(name.to_string(), ctor);
    }

    /// Build the shared provider singletons from `selected_module`.
    pub fn build(&self, config: &Config) -> Result<ProviderSet> {
        let selected = &config.selected_module;

        let vad: Arc<dyn Vad> = Arc::new(crate::voice::vad::EnergyVad::from_config(config));

        let asr = match self.asr.get(&selected.asr) {
            Some(ctor) => ctor(config)?,
            None => bail!("unknown ASR provider: {}", selected.asr),
        };
        let llm = match self.llm.get(&selected.llm) {
            Some(ctor) => ctor(config)?,
            None => bail!("unknown LLM provider: {}", selected.llm),
        };
        let tts = match self.tts.get(&selected.tts) {
            Some(ctor) => ctor(config)?,
            None => bail!("unknown TTS provider: {}", selected.tts),
        };

        let memory: Arc<dyn Memory> = match selected.memory.as_str() {
            "mem_local_short" => Arc::new(memory::ShortTermMemory::new(llm.clone())),
            _ => Arc::new(memory::NoMem),
        };

        let intent: Arc<dyn Intent> = Arc::new(intent::ConfiguredIntent::from_name(&selected.intent));

        let vision: Option<Arc<dyn Vision>> = selected
            .vllm
            .as_deref()
            .map(|name| {
                Arc::new(vision::OpenAiVision::from_config(config, name)) as Arc<dyn Vision>
            });

        Ok(ProviderSet {
            vad,
            asr,
            llm,
            tts,
            memory,
            intent,
            vision,
        })
    }

    /// Per-connection TTS binding.
    pub fn build_tts(&self, config: &Config) -> Result<Arc<dyn Tts>> {
        match self.tts.get(&config.selected_module.tts) {
            Some(ctor) => ctor(config),
            None => bail!("unknown TTS provider: {}", config.selected_module.tts),
        }
    }

    /// ASR binding for a new connection: LOCAL instances are shared, remote
    /// ones are re-instantiated because they hold per-connection channels.
    pub fn asr_for_connection(
        &self,
        shared: &Arc<dyn Asr>,
        config: &Config,
    ) -> Result<Arc<dyn Asr>> {
        if shared.interface_type() == InterfaceType::Local {
            return Ok(shared.clone());
        }
        match self.asr.get(&config.selected_module.asr) {
            Some(ctor) => ctor(config),
            None => bail!("unknown ASR provider: {}", config.selected_module.asr),
        }
    }
}
