//! Runtime configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! {
//!   "max_frame_size": 4194304,
//!   "stream": { "initial_window_size": 131072, "feedback_divisor": 8 },
//!   "writer": { "backpressure_timeout_ms": 1000 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::stream::{DEFAULT_FEEDBACK_DIVISOR, DEFAULT_WINDOW_SIZE};
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

/// Default maximum concurrent unary handlers per connection.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Top-level configuration shared by client and server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Largest frame accepted or produced, header included.
    pub max_frame_size: usize,
    /// Streaming and flow control.
    pub stream: StreamConfig,
    /// Connection writer task.
    pub writer: WriterSettings,
    /// Unary handlers allowed to run at once on one connection.
    pub max_concurrent_handlers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stream: StreamConfig::default(),
            writer: WriterSettings::default(),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }
}

impl Config {
    /// Parse from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Stream window settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Window a client requests in INIT. `0` disables flow control.
    pub initial_window_size: u32,
    /// Receive window a server grants each stream.
    pub max_window_size: u32,
    /// A FEEDBACK frame is sent every `window / feedback_divisor` bytes consumed.
    pub feedback_divisor: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_window_size: DEFAULT_WINDOW_SIZE,
            feedback_divisor: DEFAULT_FEEDBACK_DIVISOR,
        }
    }
}

/// Writer task settings in config-file form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    /// Pending frames before senders wait.
    pub max_pending_frames: usize,
    /// Channel capacity between senders and the writer task.
    pub channel_capacity: usize,
    /// How long a sender waits for backpressure to clear.
    pub backpressure_timeout_ms: u64,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl From<WriterSettings> for WriterConfig {
    fn from(s: WriterSettings) -> Self {
        WriterConfig {
            max_pending_frames: s.max_pending_frames,
            channel_capacity: s.channel_capacity,
            backpressure_timeout: Duration::from_millis(s.backpressure_timeout_ms),
        }
    }
}
