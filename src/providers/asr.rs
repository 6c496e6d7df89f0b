//! HTTP speech-recognition adapter
//!
//! Posts utterance audio (WAV, base64) to a Whisper-style transcription
//! server and parses the JSON result. The server is stateless per request,
//! so one instance is shared by all connections. Retries once to absorb
//! model cold starts.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use super::{Asr, InterfaceType};
use crate::config::Config;

pub const ASR_SAMPLE_RATE: u32 = 16000;

pub struct WhisperHttpAsr {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
    /// Directory for retained utterance WAVs; `None` disables retention.
    artifact_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    model: &'a str,
    audio: String,
}

impl WhisperHttpAsr {
    pub fn new(base_url: &str, model: &str, artifact_dir: Option<PathBuf>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
            artifact_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let provider = config.provider(&config.selected_module.asr);
        let base_url = if provider.base_url.is_empty() {
            "http://localhost:9000"
        } else {
            &provider.base_url
        };
        let model = if provider.model.is_empty() {
            "base"
        } else {
            &provider.model
        };
        let artifact_dir = config.retain_audio.then(crate::data_dir);
        Self::new(base_url, model, artifact_dir)
    }

    async fn run_transcription(&self, audio_b64: &str) -> Result<String> {
        let request = TranscribeRequest {
            model: &self.model,
            audio: audio_b64.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .context("Failed to reach ASR backend")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("ASR backend error ({}): {}", status, body));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse transcription result")?;

        if let Some(error) = result.get("error").and_then(|e| e.as_str()) {
            if !error.is_empty() {
                return Err(anyhow!("Transcription error: {}", error));
            }
        }

        Ok(result
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }

    fn write_artifact(&self, pcm: &[i16], session_id: &str) -> Option<PathBuf> {
        let dir = self.artifact_dir.as_ref()?;
        std::fs::create_dir_all(dir).ok()?;
        let path = dir.join(format!("asr_{}_{}.wav", session_id, chrono::Utc::now().timestamp_millis()));
        match write_wav(&path, pcm) {
            Ok(()) => Some(path),
            Err(e) => {
                debug!("Failed to write ASR artifact: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Asr for WhisperHttpAsr {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Local
    }

    async fn transcribe(
        &self,
        pcm: &[i16],
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>)> {
        if pcm.is_empty() {
            return Ok((String::new(), None));
        }

        debug!(
            "Transcribing {} samples ({:.1}s) for session {}",
            pcm.len(),
            pcm.len() as f64 / ASR_SAMPLE_RATE as f64,
            session_id
        );

        let wav = pcm_to_wav(pcm, ASR_SAMPLE_RATE)?;
        let audio_b64 = base64::engine::general_purpose::STANDARD.encode(&wav);

        // First call after idle may hit a model cold start; retry once.
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                info!("Retrying transcription (attempt {})", attempt + 1);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match self.run_transcription(&audio_b64).await {
                Ok(text) => {
                    let artifact = self.write_artifact(pcm, session_id);
                    return Ok((text, artifact));
                }
                Err(e) => {
                    debug!("Transcription attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("Transcription failed")))
    }
}

/// Convert PCM i16 samples to WAV bytes in memory.
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

fn write_wav(path: &PathBuf, samples: &[i16]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: ASR_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_to_wav_header() {
        let samples = vec![0i16; 16000];
        let wav = pcm_to_wav(&samples, 16000).unwrap();
        assert_eq!(wav.len(), 44 + 32000);
        assert_eq!(&wav[0..4], b"RIFF");
    }

    #[test]
    fn test_asr_is_shareable() {
        let asr = WhisperHttpAsr::new("http://localhost:9000/", "base", None);
        assert_eq!(asr.interface_type(), InterfaceType::Local);
        assert_eq!(asr.base_url, "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_empty_utterance_short_circuits() {
        let asr = WhisperHttpAsr::new("http://localhost:1", "base", None);
        let (text, artifact) = asr.transcribe(&[], "s1").await.unwrap();
        assert!(text.is_empty());
        assert!(artifact.is_none());
    }
}
