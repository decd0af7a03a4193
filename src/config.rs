// Configuration for conversion sessions
//
// Loading from disk is the embedding application's job; this type only
// carries the knobs and validates them.

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};

/// Default size of the reusable read buffer (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Source identifier used until a live peer address is known
pub const DEFAULT_SOURCE_LABEL: &str = "0.0.0.0";

/// Name given to marks inserted by the user while recording
pub const DEFAULT_MARK_LABEL: &str = "UI Mark";

/// Per-session converter configuration
///
/// # Example
/// ```
/// use memtrace_convert::config::ConverterConfig;
///
/// let config = ConverterConfig::default().with_buffer_size(4096);
/// assert_eq!(config.buffer_size, 4096);
/// assert_eq!(config.source_label, "0.0.0.0");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Size in bytes of the reusable chunk buffer
    ///
    /// Every socket receive and every dump-file read fills at most this many
    /// bytes before the chunk is handed to the transcoder.
    ///
    /// Default: 65536
    pub buffer_size: usize,

    /// Initial source identifier written into the session metadata
    ///
    /// The socket recorder replaces it with the peer address when the socket
    /// reports one.
    pub source_label: String,

    /// Name of marks inserted through `add_mark`
    pub mark_label: String,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            source_label: DEFAULT_SOURCE_LABEL.to_string(),
            mark_label: DEFAULT_MARK_LABEL.to_string(),
        }
    }
}

impl ConverterConfig {
    /// Override the chunk buffer size
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Override the initial source identifier
    pub fn with_source_label(mut self, label: impl Into<String>) -> Self {
        self.source_label = label.into();
        self
    }

    /// Override the manual mark name
    pub fn with_mark_label(mut self, label: impl Into<String>) -> Self {
        self.mark_label = label.into();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ConvertError::InvalidConfig(
                "buffer_size must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
