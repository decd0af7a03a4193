//! Handler seam: lifecycle and progress notifications for a session
//!
//! For one session the converter guarantees:
//! - `on_started` fires once, during construction, before any other call
//! - `on_progress` fires after every processed chunk, in stream order, and
//!   once more during termination
//! - `on_ended` fires once, after the output artifact is closed, and nothing
//!   follows it
//!
//! Callbacks for the socket and dump variants run on the session's reader
//! thread.

use crate::converter::SessionHandle;
use crate::meta::TraceMeta;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Receiver of session notifications
pub trait TraceFileHandler: Send + Sync + 'static {
    /// Per-session state returned from `on_started` and handed back on every
    /// later call
    type Context: Send + Sync + 'static;

    /// Session created. `session` can be kept to cancel the session or insert
    /// marks later; it does not keep the session alive.
    fn on_started(
        &self,
        output_path: &Path,
        meta: &TraceMeta,
        session: SessionHandle,
    ) -> Self::Context;

    fn on_progress(&self, context: &Self::Context, meta: &TraceMeta);

    fn on_ended(&self, context: &Self::Context);
}

impl<H: TraceFileHandler> TraceFileHandler for Arc<H> {
    type Context = H::Context;

    fn on_started(
        &self,
        output_path: &Path,
        meta: &TraceMeta,
        session: SessionHandle,
    ) -> Self::Context {
        (**self).on_started(output_path, meta, session)
    }

    fn on_progress(&self, context: &Self::Context, meta: &TraceMeta) {
        (**self).on_progress(context, meta)
    }

    fn on_ended(&self, context: &Self::Context) {
        (**self).on_ended(context)
    }
}

/// Handler that reports session activity through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

/// Context kept by [`LoggingHandler`] for one session
#[derive(Debug)]
pub struct LoggingContext {
    pub output_path: PathBuf,
    pub started_at: Instant,
    pub session: SessionHandle,
}

impl TraceFileHandler for LoggingHandler {
    type Context = LoggingContext;

    fn on_started(
        &self,
        output_path: &Path,
        meta: &TraceMeta,
        session: SessionHandle,
    ) -> Self::Context {
        tracing::info!(
            output = %output_path.display(),
            source = %meta.source,
            "Recording started"
        );

        LoggingContext {
            output_path: output_path.to_path_buf(),
            started_at: Instant::now(),
            session,
        }
    }

    fn on_progress(&self, context: &Self::Context, meta: &TraceMeta) {
        tracing::debug!(
            output = %context.output_path.display(),
            bytes = meta.input_bytes,
            marks = meta.marks().len(),
            "Recording progress"
        );

        if tracing::enabled!(tracing::Level::TRACE) {
            match meta.to_json() {
                Ok(json) => tracing::trace!(meta = %json, "Metadata snapshot"),
                Err(e) => tracing::warn!("Failed to render metadata snapshot: {}", e),
            }
        }
    }

    fn on_ended(&self, context: &Self::Context) {
        tracing::info!(
            output = %context.output_path.display(),
            elapsed_ms = context.started_at.elapsed().as_millis() as u64,
            "Recording ended"
        );
    }
}
