//! Streaming audio: VAD, decoding, utterance segmentation, TTS delivery

pub mod codec;
pub mod pipeline;
pub mod tts_stream;
pub mod vad;

pub use pipeline::{AudioEvent, ListenMode, Utterance};
pub use tts_stream::{ContentType, SentenceType, TtsMessage};
