//! TTS stage
//!
//! Consumes the ordered per-turn sentence queue, synthesizes TEXT payloads
//! into audio in the negotiated output format, and emits a framed stream to
//! the client bracketed by FIRST/LAST control boundaries. On abort the queue
//! drains without synthesizing; the turn's closing control message still
//! reaches the client so it leaves the speaking state.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::Outbound;
use crate::providers::Tts;

/// Position of a message within an assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceType {
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Synthesize the payload.
    Text,
    /// Control boundary; no audio.
    Action,
    /// Payload is a path to pre-rendered audio; stream it as-is.
    File,
}

/// One unit of the per-turn TTS queue. All messages within a turn share a
/// sentence id; exactly one First and one Last bracket the turn.
#[derive(Debug, Clone)]
pub struct TtsMessage {
    pub sentence_id: String,
    pub sentence_type: SentenceType,
    pub content_type: ContentType,
    pub payload: String,
}

impl TtsMessage {
    pub fn first(sentence_id: &str) -> Self {
        Self {
            sentence_id: sentence_id.to_string(),
            sentence_type: SentenceType::First,
            content_type: ContentType::Action,
            payload: String::new(),
        }
    }

    pub fn middle(sentence_id: &str, text: &str) -> Self {
        Self {
            sentence_id: sentence_id.to_string(),
            sentence_type: SentenceType::Middle,
            content_type: ContentType::Text,
            payload: text.to_string(),
        }
    }

    pub fn file(sentence_id: &str, path: &str) -> Self {
        Self {
            sentence_id: sentence_id.to_string(),
            sentence_type: SentenceType::Middle,
            content_type: ContentType::File,
            payload: path.to_string(),
        }
    }

    pub fn last(sentence_id: &str) -> Self {
        Self {
            sentence_id: sentence_id.to_string(),
            sentence_type: SentenceType::Last,
            content_type: ContentType::Action,
            payload: String::new(),
        }
    }
}

pub fn spawn_tts_stage(
    tts: Arc<dyn Tts>,
    mut queue: mpsc::Receiver<TtsMessage>,
    outbound: mpsc::Sender<Outbound>,
    abort: Arc<AtomicBool>,
    speaking: Arc<AtomicBool>,
    worker_pool: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = stop.changed() => break,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message.sentence_type {
                SentenceType::First => {
                    speaking.store(true, Ordering::SeqCst);
                    let _ = outbound
                        .send(Outbound::Json(json!({
                            "type": "tts",
                            "state": "start",
                            "sentence_id": message.sentence_id,
                        })))
                        .await;
                }
                SentenceType::Last => {
                    speaking.store(false, Ordering::SeqCst);
                    let _ = outbound
                        .send(Outbound::Json(json!({
                            "type": "tts",
                            "state": "stop",
                            "sentence_id": message.sentence_id,
                        })))
                        .await;
                }
                SentenceType::Middle => {
                    if abort.load(Ordering::SeqCst) {
                        // Turn aborted: drain without synthesizing.
                        debug!("Dropping TTS sentence after abort");
                        continue;
                    }
                    match message.content_type {
                        ContentType::Text => {
                            send_sentence(&tts, &outbound, &abort, &worker_pool, &message).await;
                        }
                        ContentType::File => {
                            match tokio::fs::read(&message.payload).await {
                                Ok(audio) => {
                                    let _ = outbound.send(Outbound::Binary(audio)).await;
                                }
                                Err(e) => warn!(
                                    "Failed to read audio file {}: {}",
                                    message.payload, e
                                ),
                            }
                        }
                        ContentType::Action => {}
                    }
                }
            }
        }
        debug!("TTS stage exited");
    })
}

async fn send_sentence(
    tts: &Arc<dyn Tts>,
    outbound: &mpsc::Sender<Outbound>,
    abort: &Arc<AtomicBool>,
    worker_pool: &Arc<Semaphore>,
    message: &TtsMessage,
) {
    let _ = outbound
        .send(Outbound::Json(json!({
            "type": "tts",
            "state": "sentence_start",
            "text": message.payload,
            "sentence_id": message.sentence_id,
        })))
        .await;

    // Synthesis is provider I/O; run it under the bounded worker pool so one
    // slow backend cannot starve the connection's other stages.
    let audio = {
        let _permit = match worker_pool.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        tts.synthesize(&message.payload).await
    };

    match audio {
        Ok(audio) => {
            if abort.load(Ordering::SeqCst) {
                debug!("Discarding synthesized audio after abort");
                return;
            }
            if !audio.data.is_empty() {
                let _ = outbound.send(Outbound::Binary(audio.data)).await;
            }
            let mut end = json!({
                "type": "tts",
                "state": "sentence_end",
                "sentence_id": message.sentence_id,
            });
            if let Some(duration) = audio.duration_ms {
                end["duration_ms"] = json!(duration);
            }
            let _ = outbound.send(Outbound::Json(end)).await;
        }
        Err(e) => {
            warn!("TTS synthesis failed: {}", e);
            let _ = outbound
                .send(Outbound::Json(json!({
                    "type": "tts",
                    "state": "sentence_end",
                    "sentence_id": message.sentence_id,
                })))
                .await;
        }
    }
}

/// Split streamed text into speakable sentences; the trailing fragment stays
/// buffered until more text arrives or the stream ends.
pub fn split_sentences(buffer: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in buffer.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '。' | '！' | '？' | ';' | '；') {
            let trimmed = current.trim();
            if trimmed.chars().count() > 1 {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    *buffer = current;
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TtsAudio;
    use anyhow::Result;
    use async_trait::async_trait;

    struct EchoTts;

    #[async_trait]
    impl Tts for EchoTts {
        fn voice(&self) -> &str {
            "echo"
        }

        async fn synthesize(&self, text: &str) -> Result<TtsAudio> {
            Ok(TtsAudio {
                data: text.as_bytes().to_vec(),
                duration_ms: Some(42),
            })
        }
    }

    fn stage() -> (
        mpsc::Sender<TtsMessage>,
        mpsc::Receiver<Outbound>,
        Arc<AtomicBool>,
        Arc<AtomicBool>,
        watch::Sender<bool>,
    ) {
        let (queue_tx, queue_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let abort = Arc::new(AtomicBool::new(false));
        let speaking = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);
        spawn_tts_stage(
            Arc::new(EchoTts),
            queue_rx,
            out_tx,
            abort.clone(),
            speaking.clone(),
            Arc::new(Semaphore::new(5)),
            stop_rx,
        );
        (queue_tx, out_rx, abort, speaking, stop_tx)
    }

    fn state_of(outbound: &Outbound) -> Option<String> {
        match outbound {
            Outbound::Json(v) if v["type"] == "tts" => {
                v["state"].as_str().map(|s| s.to_string())
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_turn_is_bracketed_first_to_last() {
        let (tx, mut rx, _abort, speaking, _stop) = stage();
        tx.send(TtsMessage::first("s1")).await.unwrap();
        tx.send(TtsMessage::middle("s1", "Hello there.")).await.unwrap();
        tx.send(TtsMessage::last("s1")).await.unwrap();

        let mut states = Vec::new();
        let mut binary = 0;
        for _ in 0..5 {
            match rx.recv().await.unwrap() {
                Outbound::Binary(_) => binary += 1,
                outbound => {
                    if let Some(state) = state_of(&outbound) {
                        states.push(state);
                    }
                }
            }
        }
        assert_eq!(states, vec!["start", "sentence_start", "sentence_end", "stop"]);
        assert_eq!(binary, 1);
        assert!(!speaking.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abort_drains_without_audio_but_stop_arrives() {
        let (tx, mut rx, abort, _speaking, _stop) = stage();
        abort.store(true, Ordering::SeqCst);
        tx.send(TtsMessage::first("s1")).await.unwrap();
        tx.send(TtsMessage::middle("s1", "never spoken")).await.unwrap();
        tx.send(TtsMessage::last("s1")).await.unwrap();

        let mut states = Vec::new();
        let mut binary = 0;
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Outbound::Binary(_) => binary += 1,
                outbound => {
                    if let Some(state) = state_of(&outbound) {
                        states.push(state);
                    }
                }
            }
        }
        assert_eq!(states, vec!["start", "stop"]);
        assert_eq!(binary, 0);
    }

    #[tokio::test]
    async fn test_duration_metadata_forwarded() {
        let (tx, mut rx, _abort, _speaking, _stop) = stage();
        tx.send(TtsMessage::middle("s1", "Hi.")).await.unwrap();
        // sentence_start, binary, sentence_end
        let _ = rx.recv().await.unwrap();
        let _ = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Json(v) => assert_eq!(v["duration_ms"], 42),
            _ => panic!("expected sentence_end json"),
        }
    }

    #[test]
    fn test_split_sentences_keeps_fragment() {
        let mut buffer = "One. Two! Three".to_string();
        let sentences = split_sentences(&mut buffer);
        assert_eq!(sentences, vec!["One.", "Two!"]);
        assert_eq!(buffer, " Three");
    }

    #[test]
    fn test_split_sentences_cjk_punctuation() {
        let mut buffer = "你好。再见".to_string();
        let sentences = split_sentences(&mut buffer);
        assert_eq!(sentences, vec!["你好。"]);
        assert_eq!(buffer, "再见");
    }
}
