//! Voxgate - Real-time voice-assistant gateway
//!
//! Embedded devices open a full-duplex channel (binary audio frames + JSON
//! control messages); per connection the gateway runs a streaming pipeline:
//! voice-activity detection, speech recognition, a tool-calling dialogue
//! model, and speech synthesis back to the device. A small HTTP surface
//! handles device bootstrap and vision analysis.
//!
//! # Example
//!
//! ```ignore
//! use voxgate::config::Config;
//! use voxgate::server::{self, ServerContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = ServerContext::new(Config::load_default(), None)?;
//!     server::start_ws_server(ctx).await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dialogue;
pub mod error;
pub mod providers;
pub mod server;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use connection::{ConnectionHandler, ConnectionState};
pub use dialogue::{Dialogue, Message, Role};
pub use error::GatewayError;
pub use server::ServerContext;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Data directory for audio artifacts and greeting caches.
pub fn data_dir() -> std::path::PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("voxgate")
}
