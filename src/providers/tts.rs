//! Speech-synthesis adapters
//!
//! `SpeechHttpTts` talks to an OpenAI-compatible `/v1/audio/speech` endpoint
//! and returns audio in the configured output format (Opus by default).
//! `DefaultTts` is the degraded-mode fallback installed when the real
//! provider fails to initialize: it plays one fixed clip regardless of text.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{Tts, TtsAudio};
use crate::config::Config;

pub struct SpeechHttpTts {
    base_url: String,
    voice: String,
    format: String,
    client: Client,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

impl SpeechHttpTts {
    pub fn new(base_url: &str, voice: &str, format: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            voice: voice.to_string(),
            format: format.to_string(),
            client: Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let provider = config.provider(&config.selected_module.tts);
        let base_url = if provider.base_url.is_empty() {
            "http://localhost:3001"
        } else {
            &provider.base_url
        };
        let voice = if provider.voice.is_empty() {
            "default"
        } else {
            &provider.voice
        };
        Self::new(base_url, voice, "opus")
    }
}

#[async_trait]
impl Tts for SpeechHttpTts {
    fn voice(&self) -> &str {
        &self.voice
    }

    async fn synthesize(&self, text: &str) -> Result<TtsAudio> {
        if text.trim().is_empty() {
            return Ok(TtsAudio {
                data: Vec::new(),
                duration_ms: None,
            });
        }

        debug!("TTS synthesizing ({} chars): {:.60}", text.len(), text);

        let request = SpeechRequest {
            model: "tts-1",
            input: text,
            voice: &self.voice,
            response_format: &self.format,
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to reach TTS backend")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("TTS backend error ({}): {}", status, body));
        }

        let duration_ms = response
            .headers()
            .get("x-audio-duration-ms")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let data = response
            .bytes()
            .await
            .context("Failed to read TTS response")?
            .to_vec();

        Ok(TtsAudio { data, duration_ms })
    }
}

/// Fallback provider that plays a single fixed clip. Installed when the
/// configured TTS fails to initialize so the device still hears something.
pub struct DefaultTts {
    clip: Vec<u8>,
}

impl DefaultTts {
    pub fn new() -> Self {
        Self {
            clip: fixed_clip_wav(),
        }
    }
}

impl Default for DefaultTts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tts for DefaultTts {
    fn voice(&self) -> &str {
        "default"
    }

    async fn synthesize(&self, _text: &str) -> Result<TtsAudio> {
        Ok(TtsAudio {
            data: self.clip.clone(),
            duration_ms: Some(300),
        })
    }
}

/// 300 ms notification tone, WAV-framed, used as the fixed clip.
fn fixed_clip_wav() -> Vec<u8> {
    let sample_rate = 16000u32;
    let samples: Vec<i16> = (0..(sample_rate as usize * 3 / 10))
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            // Fade out to avoid a click at the end.
            let envelope = 1.0 - (i as f32 / (sample_rate as f32 * 0.3));
            ((t * 660.0 * 2.0 * std::f32::consts::PI).sin() * envelope * 8000.0) as i16
        })
        .collect();
    super::asr::pcm_to_wav(&samples, sample_rate).unwrap_or_default()
}
