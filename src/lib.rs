//! memtrace-convert - Streaming memory-trace recorder
//!
//! This library records raw memory-trace captures into trace artifacts. Bytes
//! come from one of two live sources, a connected socket
//! ([`recorder::TraceRecorder`]) or a previously captured dump file
//! ([`dump::DumpConverter`]), and are streamed through a
//! [`transcoder::Transcoder`] that writes the artifact while a
//! [`handler::TraceFileHandler`] is told about start, progress and end of
//! the session.

pub mod clock;
pub mod config;
pub mod converter;
pub mod dump;
pub mod error;
pub mod handler;
pub mod meta;
pub mod recorder;
pub mod transcoder;

pub use error::{ConvertError, Result};
