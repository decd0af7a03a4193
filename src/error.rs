//! Error taxonomy for trace conversion sessions
//!
//! Only conditions that indicate a real defect surface as a [`ConvertError`]:
//! failing to create the output artifact or open a dump file (at construction),
//! and dump-file read failures (after cleanup has run). Socket resets, forced
//! closes and similar conditions are expected during a live capture and are
//! mapped to end-of-stream instead.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while constructing or running a conversion session
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Failed to create output artifact {}: {source}", path.display())]
    CreateOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open dump file {}: {source}", path.display())]
    OpenDump {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read dump file {}: {source}", path.display())]
    ReadDump {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Transcoder failed: {0}")]
    Transcode(#[source] io::Error),

    #[error("Failed to finalize output artifact: {0}")]
    Finalize(#[source] io::Error),

    #[error("Invalid converter configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn reader thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Reader thread panicked")]
    ReaderPanicked,
}

/// Result type for conversion operations
pub type Result<T> = std::result::Result<T, ConvertError>;
