//! Gateway error taxonomy
//!
//! Errors inside a single assistant turn are contained at the turn boundary;
//! reader-loop errors propagate to the supervisor which runs teardown.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Rejected at channel upgrade; close without further messages.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Device is not bound to this server; chat continues with reduced features.
    #[error("device not bound: {0}")]
    DeviceUnbound(String),

    /// A provider failed to initialize; the connection degrades instead of closing.
    #[error("provider init failed: {0}")]
    ProviderInit(String),

    /// Transcription failed; a spoken apology is emitted, connection survives.
    #[error("speech recognition failed: {0}")]
    Asr(String),

    /// The LLM stream failed; a sentinel sentence closes the turn normally.
    #[error("language model error: {0}")]
    Llm(String),

    /// Tool invocation failed; reported back into the loop as an ERROR action.
    #[error("tool call failed: {0}")]
    Tool(String),

    /// No activity for longer than the idle timeout.
    #[error("connection idle timeout")]
    IdleTimeout,

    /// The peer closed the channel.
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = GatewayError::Asr("backend unreachable".to_string());
        assert_eq!(
            err.to_string(),
            "speech recognition failed: backend unreachable"
        );
    }
}
