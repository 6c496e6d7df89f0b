//! Wake-phrase greeting cache
//!
//! A configured wake phrase is answered from a per-voice cached audio file
//! instead of a full LLM round-trip. After a TTL the greeting is
//! regenerated in the background (LLM text, then TTS), guarded by a
//! process-wide lock so concurrent detections don't stampede the providers.

use once_cell::sync::Lazy;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::{chat, ConnectionState};
use crate::voice::tts_stream::TtsMessage;

/// Seconds before a served greeting is considered stale and regenerated.
pub const GREETING_REFRESH_SECS: u64 = 5;

/// Per-voice cached greeting.
#[derive(Debug, Clone)]
pub struct WakeupEntry {
    pub voice: String,
    pub file_path: PathBuf,
    pub refreshed_at: u64,
    pub text: String,
}

/// Process-wide greeting cache; initialized at first use, flushed on
/// reconfigure. Read-mostly.
pub struct WakeupCache {
    entries: Mutex<HashMap<String, WakeupEntry>>,
}

impl WakeupCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, voice: &str) -> Option<WakeupEntry> {
        self.entries.lock().unwrap().get(voice).cloned()
    }

    pub fn update(&self, voice: &str, file_path: PathBuf, text: String) {
        let entry = WakeupEntry {
            voice: voice.to_string(),
            file_path,
            refreshed_at: now_secs(),
            text,
        };
        self.entries.lock().unwrap().insert(voice.to_string(), entry);
    }

    pub fn flush(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Stable cache path for a voice under the data directory.
    pub fn file_path_for(voice: &str) -> PathBuf {
        let digest = Sha256::digest(voice.as_bytes());
        crate::data_dir().join(format!("wakeup_{}.audio", hex::encode(&digest[..8])))
    }
}

pub static WAKEUP_CACHE: Lazy<WakeupCache> = Lazy::new(WakeupCache::new);

static REGEN_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Lowercased text with punctuation removed and whitespace collapsed, used
/// for wake-phrase comparison.
pub fn filter_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Serve a cached greeting for a wake phrase. Returns `true` when the phrase
/// matched and audio was served; `false` lets the caller fall through to a
/// normal chat turn.
pub async fn check_wakeup_words(state: &Arc<ConnectionState>, text: &str) -> bool {
    let config = state.config();
    if !config.enable_wakeup_words_response_cache {
        return false;
    }
    let Some(providers) = state.providers() else {
        return false;
    };

    let filtered = filter_punctuation(text);
    if !config
        .wakeup_words
        .iter()
        .any(|w| filter_punctuation(w) == filtered)
    {
        return false;
    }

    chat::send_stt(state, text).await;

    let voice = providers.tts.voice().to_string();
    let entry = WAKEUP_CACHE.get(&voice);

    let Some(entry) = entry.filter(|e| e.file_path.exists()) else {
        // Nothing cached yet: warm the cache and let chat answer this one.
        spawn_regeneration(state.clone(), voice);
        return false;
    };

    state.client_abort.store(false, Ordering::SeqCst);
    let sentence_id = uuid::Uuid::new_v4().simple().to_string();
    *state.sentence_id.lock().unwrap() = Some(sentence_id.clone());

    info!("Serving cached greeting: {}", entry.text);
    state.enqueue_tts(TtsMessage::first(&sentence_id)).await;
    state
        .enqueue_tts(TtsMessage::file(
            &sentence_id,
            &entry.file_path.to_string_lossy(),
        ))
        .await;
    state.enqueue_tts(TtsMessage::last(&sentence_id)).await;

    state
        .dialogue
        .lock()
        .unwrap()
        .put(crate::dialogue::Message::assistant(entry.text.clone()));

    if now_secs().saturating_sub(entry.refreshed_at) > GREETING_REFRESH_SECS {
        spawn_regeneration(state.clone(), voice);
    }
    true
}

/// Regenerate the greeting for a voice in the background.
fn spawn_regeneration(state: Arc<ConnectionState>, voice: String) {
    tokio::spawn(async move {
        let Ok(_guard) = REGEN_LOCK.try_lock() else {
            debug!("Greeting regeneration already in flight");
            return;
        };
        let Some(providers) = state.providers() else {
            return;
        };
        let config = state.config();

        let words = &config.wakeup_words;
        if words.is_empty() {
            return;
        }
        let wake_word = &words[rand::rng().random_range(0..words.len())];
        let question = format!(
            "The user just said `{wake_word}` to wake you up. Reply with a \
             single warm greeting of 20 to 30 words. No explanations, no emoji."
        );

        let text = match providers
            .llm
            .response_no_stream(&config.prompt, &question)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => return,
            Err(e) => {
                warn!("Greeting text generation failed: {}", e);
                return;
            }
        };

        let audio = match providers.tts.synthesize(&text).await {
            Ok(audio) if !audio.data.is_empty() => audio,
            Ok(_) => return,
            Err(e) => {
                warn!("Greeting synthesis failed: {}", e);
                return;
            }
        };

        let path = WakeupCache::file_path_for(&voice);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&path, &audio.data).await {
            warn!("Failed to write greeting cache file: {}", e);
            return;
        }

        WAKEUP_CACHE.update(&voice, path, text);
        info!("Greeting cache refreshed for voice {}", voice);
    });
}
