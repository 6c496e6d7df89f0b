//! Audio decoding
//!
//! The gateway never implements a codec; it invokes one. `pcm16` frames pass
//! through untouched. Container formats (opus-in-ogg, webm) go through a
//! persistent ffmpeg child process: frames are piped to stdin and decoded
//! s16le 16 kHz mono samples are read back from stdout. Decoded samples may
//! lag the frame that produced them; the pipeline tolerates that.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[async_trait]
pub trait AudioDecoder: Send {
    /// Feed one encoded frame; returns whatever samples are decoded so far.
    async fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>>;
}

/// Build a decoder for the format negotiated in `hello.audio_params.format`.
pub fn decoder_for_format(format: &str) -> Result<Box<dyn AudioDecoder>> {
    match format {
        "pcm" | "pcm16" => Ok(Box::new(PcmDecoder)),
        "opus" | "ogg" => Ok(Box::new(FfmpegStreamDecoder::spawn("ogg")?)),
        "webm" => Ok(Box::new(FfmpegStreamDecoder::spawn("webm")?)),
        other => Err(anyhow!("unsupported audio format: {}", other)),
    }
}

/// Little-endian s16 passthrough.
pub struct PcmDecoder;

#[async_trait]
impl AudioDecoder for PcmDecoder {
    async fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>> {
        Ok(frame
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect())
    }
}

/// Persistent ffmpeg child: container frames in, raw samples out.
pub struct FfmpegStreamDecoder {
    child: Child,
    stdin: ChildStdin,
    samples_rx: mpsc::UnboundedReceiver<Vec<i16>>,
}

impl FfmpegStreamDecoder {
    pub fn spawn(input_format: &str) -> Result<Self> {
        let mut child = tokio::process::Command::new("ffmpeg")
            .args([
                "-f", input_format,
                "-i", "pipe:0",
                "-f", "s16le",
                "-ar", "16000",
                "-ac", "1",
                "-loglevel", "error",
                "pipe:1",
            ])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("Failed to spawn ffmpeg decoder")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdin unavailable"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout unavailable"))?;

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut carry: Option<u8> = None;
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut bytes = Vec::with_capacity(n + 1);
                        if let Some(b) = carry.take() {
                            bytes.push(b);
                        }
                        bytes.extend_from_slice(&buf[..n]);
                        if bytes.len() % 2 == 1 {
                            carry = bytes.pop();
                        }
                        let samples: Vec<i16> = bytes
                            .chunks_exact(2)
                            .map(|c| i16::from_le_bytes([c[0], c[1]]))
                            .collect();
                        if samples_tx.send(samples).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("ffmpeg stdout read error: {}", e);
                        break;
                    }
                }
            }
            debug!("ffmpeg decoder output closed");
        });

        Ok(Self {
            child,
            stdin,
            samples_rx,
        })
    }
}

#[async_trait]
impl AudioDecoder for FfmpegStreamDecoder {
    async fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>> {
        self.stdin
            .write_all(frame)
            .await
            .context("ffmpeg stdin write failed")?;

        // Collect whatever the decoder has produced without blocking on it.
        let mut samples = Vec::new();
        while let Ok(batch) = self.samples_rx.try_recv() {
            samples.extend(batch);
        }
        Ok(samples)
    }
}

impl Drop for FfmpegStreamDecoder {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}
