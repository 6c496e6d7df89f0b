//! Per-connection audio pipeline
//!
//! Binary frames enter a bounded queue; this worker consumes them in order,
//! decodes, runs VAD, and segments utterances. Two modes: manual, where the
//! client's `listen stop` ends the utterance regardless of the VAD verdict,
//! and auto, where the sliding verdict window decides end-of-speech. On an
//! utterance boundary the concatenated PCM is handed to the ASR stage and
//! VAD state resets.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::AudioDecoder;
use super::vad::VadWindow;
use crate::providers::Vad;

/// Frames shorter than this are treated as noise and discarded (300 ms at 16 kHz).
pub const MIN_UTTERANCE_SAMPLES: usize = 4800;

/// Depth of the bounded frame queue feeding this worker.
pub const AUDIO_QUEUE_DEPTH: usize = 256;

/// Pre-roll frames kept so speech onset is not clipped in auto mode.
const PREROLL_FRAMES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenMode {
    #[default]
    Auto,
    Manual,
}

impl ListenMode {
    pub fn from_str(mode: &str) -> Self {
        match mode {
            "manual" => ListenMode::Manual,
            _ => ListenMode::Auto,
        }
    }
}

/// Control and data events consumed by the pipeline worker, in arrival order.
#[derive(Debug)]
pub enum AudioEvent {
    Frame(Vec<u8>),
    ListenStart(ListenMode),
    ListenStop,
    Reset,
    /// Renegotiated audio format; swaps the decoder.
    SetFormat(String),
}

/// Transient value: PCM between voice-start and voice-stop, plus its session.
/// Lives only until the ASR stage consumes it.
#[derive(Debug)]
pub struct Utterance {
    pub session_id: String,
    pub pcm: Vec<i16>,
}

pub fn spawn_audio_pipeline(
    session_id: String,
    vad: Arc<dyn Vad>,
    mut decoder: Box<dyn AudioDecoder>,
    mut events: mpsc::Receiver<AudioEvent>,
    utterances: mpsc::Sender<Utterance>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut mode = ListenMode::Auto;
        let mut armed = false;
        let mut buffer: Vec<i16> = Vec::new();
        let mut window = VadWindow::default();
        let mut preroll: VecDeque<Vec<i16>> = VecDeque::with_capacity(PREROLL_FRAMES);

        loop {
            let event = tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                AudioEvent::ListenStart(new_mode) => {
                    mode = new_mode;
                    armed = true;
                    buffer.clear();
                    window.reset();
                    preroll.clear();
                    debug!("Listen start ({:?}), audio buffer cleared", mode);
                }
                AudioEvent::ListenStop => {
                    // Explicit stop ends the utterance regardless of VAD.
                    if buffer.len() >= MIN_UTTERANCE_SAMPLES {
                        emit(&utterances, &session_id, std::mem::take(&mut buffer)).await;
                    } else if !buffer.is_empty() {
                        debug!("Discarding short utterance ({} samples)", buffer.len());
                        buffer.clear();
                    } else {
                        warn!("Listen stop with empty audio buffer");
                    }
                    armed = false;
                    window.reset();
                    preroll.clear();
                }
                AudioEvent::Reset => {
                    buffer.clear();
                    window.reset();
                    preroll.clear();
                }
                AudioEvent::SetFormat(format) => {
                    match super::codec::decoder_for_format(&format) {
                        Ok(new_decoder) => {
                            decoder = new_decoder;
                            buffer.clear();
                            window.reset();
                            preroll.clear();
                            debug!("Audio decoder switched to {}", format);
                        }
                        Err(e) => warn!("Keeping current decoder: {}", e),
                    }
                }
                AudioEvent::Frame(frame) => {
                    let samples = match decoder.decode(&frame).await {
                        Ok(samples) => samples,
                        Err(e) => {
                            debug!("Frame decode failed, skipping: {}", e);
                            continue;
                        }
                    };
                    if samples.is_empty() {
                        continue;
                    }

                    match mode {
                        ListenMode::Manual => {
                            if armed {
                                buffer.extend_from_slice(&samples);
                            }
                        }
                        ListenMode::Auto => {
                            let had_voice = window.have_voice();
                            window.push(vad.is_voice(&samples));

                            if window.have_voice() {
                                if !had_voice {
                                    // Prepend pre-roll so the onset survives.
                                    for frame in preroll.drain(..) {
                                        buffer.extend_from_slice(&frame);
                                    }
                                }
                                buffer.extend_from_slice(&samples);

                                if window.voice_stopped() {
                                    if buffer.len() >= MIN_UTTERANCE_SAMPLES {
                                        emit(
                                            &utterances,
                                            &session_id,
                                            std::mem::take(&mut buffer),
                                        )
                                        .await;
                                    } else {
                                        buffer.clear();
                                    }
                                    window.reset();
                                }
                            } else {
                                if preroll.len() == PREROLL_FRAMES {
                                    preroll.pop_front();
                                }
                                preroll.push_back(samples);
                            }
                        }
                    }
                }
            }
        }
        debug!("Audio pipeline for session {} exited", session_id);
    })
}

async fn emit(utterances: &mpsc::Sender<Utterance>, session_id: &str, pcm: Vec<i16>) {
    info!(
        "Utterance complete: {:.1}s of audio",
        pcm.len() as f64 / 16000.0
    );
    let _ = utterances
        .send(Utterance {
            session_id: session_id.to_string(),
            pcm,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec::PcmDecoder;
    use crate::voice::vad::EnergyVad;

    fn pcm_frame(amplitude: i16, samples: usize) -> Vec<u8> {
        let mut frame = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            frame.extend_from_slice(&amplitude.to_le_bytes());
        }
        frame
    }

    fn start_pipeline() -> (
        mpsc::Sender<AudioEvent>,
        mpsc::Receiver<Utterance>,
        watch::Sender<bool>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let (utt_tx, utt_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        spawn_audio_pipeline(
            "test-session".to_string(),
            Arc::new(EnergyVad::new(200.0)),
            Box::new(PcmDecoder),
            event_rx,
            utt_tx,
            stop_rx,
        );
        (event_tx, utt_rx, stop_tx)
    }

    #[tokio::test]
    async fn test_manual_mode_emits_on_stop() {
        let (tx, mut rx, _stop) = start_pipeline();
        tx.send(AudioEvent::ListenStart(ListenMode::Manual)).await.unwrap();
        // 10 frames x 800 samples = 8000 samples, above the minimum
        for _ in 0..10 {
            tx.send(AudioEvent::Frame(pcm_frame(3000, 800))).await.unwrap();
        }
        tx.send(AudioEvent::ListenStop).await.unwrap();

        let utterance = rx.recv().await.unwrap();
        assert_eq!(utterance.session_id, "test-session");
        assert_eq!(utterance.pcm.len(), 8000);
    }

    #[tokio::test]
    async fn test_manual_short_utterance_discarded() {
        let (tx, mut rx, _stop) = start_pipeline();
        tx.send(AudioEvent::ListenStart(ListenMode::Manual)).await.unwrap();
        tx.send(AudioEvent::Frame(pcm_frame(3000, 100))).await.unwrap();
        tx.send(AudioEvent::ListenStop).await.unwrap();
        // Nothing emitted; a later full utterance still flows.
        for _ in 0..10 {
            tx.send(AudioEvent::Frame(pcm_frame(3000, 800))).await.unwrap();
        }
        tx.send(AudioEvent::ListenStart(ListenMode::Manual)).await.unwrap();
        for _ in 0..10 {
            tx.send(AudioEvent::Frame(pcm_frame(3000, 800))).await.unwrap();
        }
        tx.send(AudioEvent::ListenStop).await.unwrap();
        let utterance = rx.recv().await.unwrap();
        assert_eq!(utterance.pcm.len(), 8000);
    }

    #[tokio::test]
    async fn test_auto_mode_vad_segmentation() {
        let (tx, mut rx, _stop) = start_pipeline();
        tx.send(AudioEvent::ListenStart(ListenMode::Auto)).await.unwrap();
        // Speech: loud frames latch voice and accumulate
        for _ in 0..8 {
            tx.send(AudioEvent::Frame(pcm_frame(3000, 800))).await.unwrap();
        }
        // Silence: five quiet frames fill the window and end the utterance
        for _ in 0..6 {
            tx.send(AudioEvent::Frame(pcm_frame(0, 800))).await.unwrap();
        }
        let utterance = rx.recv().await.unwrap();
        assert!(utterance.pcm.len() >= MIN_UTTERANCE_SAMPLES);
    }

    #[tokio::test]
    async fn test_stop_signal_ends_worker() {
        let (tx, _rx, stop) = start_pipeline();
        stop.send(true).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Worker is gone; sends still succeed until the buffer fills, but the
        // channel eventually reports closure.
        let mut closed = false;
        for _ in 0..AUDIO_QUEUE_DEPTH + 1 {
            if tx.try_send(AudioEvent::Reset).is_err() {
                closed = true;
                break;
            }
        }
        assert!(closed);
    }
}
