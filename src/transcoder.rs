//! Transcoder seam: turns raw capture bytes into the output artifact
//!
//! The converter owns the artifact writer and lends it to the transcoder on
//! every call, so closing the artifact stays the converter's job alone.

use crate::clock::LogicalClock;
use crate::meta::TraceMeta;
use std::io::{self, Write};

/// Consumer of raw trace bytes
///
/// Implementations parse the capture stream, keep [`TraceMeta`] up to date
/// and write the structured trace into `out`. Calls for one session are
/// serialized by the converter.
pub trait Transcoder: Send + 'static {
    /// Session metadata maintained by this transcoder
    fn meta(&self) -> &TraceMeta;

    fn meta_mut(&mut self) -> &mut TraceMeta;

    /// Ingest one chunk of raw bytes
    ///
    /// `chunk` may be empty: a socket read that failed still delivers its
    /// (zero) byte count.
    fn update(&mut self, chunk: &[u8], out: &mut dyn Write) -> io::Result<()>;

    /// Finalize the artifact. Called exactly once, during termination.
    ///
    /// Implementations should leave the metadata in the `Ended` state.
    fn flush(&mut self, out: &mut dyn Write) -> io::Result<()>;

    /// Current logical clock reading, used to stamp marks
    fn current_timestamp(&self) -> u64;
}

/// Transcoder that stores the capture stream verbatim
///
/// The logical clock is the stream offset: it advances by the length of
/// every ingested chunk, so a mark records how many bytes had arrived when
/// it was inserted.
///
/// # Example
///
/// ```
/// use memtrace_convert::transcoder::{PassthroughTranscoder, Transcoder};
///
/// let mut out = Vec::new();
/// let mut transcoder = PassthroughTranscoder::new("0.0.0.0");
/// transcoder.update(b"\x01\x02\x03", &mut out).unwrap();
/// transcoder.flush(&mut out).unwrap();
///
/// assert_eq!(out, vec![1, 2, 3]);
/// assert_eq!(transcoder.current_timestamp(), 3);
/// assert!(!transcoder.meta().is_recording());
/// ```
#[derive(Debug)]
pub struct PassthroughTranscoder {
    meta: TraceMeta,
    clock: LogicalClock,
    chunks: u64,
}

impl PassthroughTranscoder {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            meta: TraceMeta::new(source),
            clock: LogicalClock::new(),
            chunks: 0,
        }
    }

    /// Number of non-empty chunks ingested
    pub fn chunks(&self) -> u64 {
        self.chunks
    }
}

impl Default for PassthroughTranscoder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SOURCE_LABEL)
    }
}

impl Transcoder for PassthroughTranscoder {
    fn meta(&self) -> &TraceMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut TraceMeta {
        &mut self.meta
    }

    fn update(&mut self, chunk: &[u8], out: &mut dyn Write) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        out.write_all(chunk)?;

        let len = chunk.len() as u64;
        self.meta.input_bytes += len;
        self.clock.advance(len);
        self.chunks += 1;
        Ok(())
    }

    fn flush(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.flush()?;
        self.meta.finish();
        Ok(())
    }

    fn current_timestamp(&self) -> u64 {
        self.clock.now()
    }
}
