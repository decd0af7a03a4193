//! Conversion session core and the base converter
//!
//! Every converter variant drives the same [`Session`]: it owns the output
//! artifact and the transcoder, pushes chunks through the transcoder, and
//! runs the termination sequence exactly once:
//!
//! ```text
//! flush transcoder → close artifact → final on_progress → on_ended
//! ```
//!
//! Variants differ only in where bytes come from and how cancellation
//! reaches the reader:
//!
//! - [`TraceConverter`]: bytes are pushed by the owner
//! - [`TraceRecorder`](crate::recorder::TraceRecorder): a live socket
//! - [`DumpConverter`](crate::dump::DumpConverter): a previously captured dump file

use crate::config::ConverterConfig;
use crate::error::{ConvertError, Result};
use crate::handler::TraceFileHandler;
use crate::meta::{TraceMark, TraceMeta};
use crate::transcoder::Transcoder;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

/// Operations shared by all converter variants
///
/// `cancel` and `add_mark` default to no-ops; variants with a cancellable
/// input or a live clock override them.
pub trait Converter {
    /// Ask the session to stop reading. Termination still runs, on the
    /// session's own reader.
    fn cancel(&self) {}

    /// Insert a manual mark at the current logical time
    fn add_mark(&self) {}

    /// Tear the session down. Idempotent, never fails, and safe to call
    /// while the reader is still delivering chunks.
    fn dispose(&self);

    fn output_path(&self) -> &Path;

    /// Whether the termination sequence has run
    fn is_finished(&self) -> bool;
}

/// Control surface a variant exposes to its [`SessionHandle`]
pub(crate) trait SessionControl: Send + Sync {
    fn cancel(&self) {}

    fn add_mark(&self) {}
}

/// Weak handle to a running session, given to the handler in `on_started`
///
/// Holding a handle does not keep the session alive. Once the converter has
/// been dropped, every call becomes a no-op and returns `false`.
#[derive(Clone)]
pub struct SessionHandle {
    control: Weak<dyn SessionControl>,
}

impl SessionHandle {
    pub(crate) fn new(control: Weak<dyn SessionControl>) -> Self {
        Self { control }
    }

    /// Request cancellation. Returns `false` if the session is gone.
    pub fn cancel(&self) -> bool {
        match self.control.upgrade() {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    /// Insert a manual mark. Returns `false` if the session is gone.
    pub fn add_mark(&self) -> bool {
        match self.control.upgrade() {
            Some(control) => {
                control.add_mark();
                true
            }
            None => false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.control.strong_count() > 0
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a panicking callback poisoned it
///
/// Teardown must still run after a transcoder panic, so poisoning is not
/// treated as fatal.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one conversion session, shared by every variant
pub(crate) struct Session<H: TraceFileHandler, T: Transcoder> {
    output_path: PathBuf,
    handler: H,
    context: OnceLock<H::Context>,
    transcoder: Mutex<T>,
    artifact: Mutex<Option<BufWriter<File>>>,
    /// Serializes chunk delivery against termination so that no progress
    /// notification can follow `on_ended`
    delivery: Mutex<()>,
    terminated: AtomicBool,
    mark_label: String,
}

impl<H: TraceFileHandler, T: Transcoder> Session<H, T> {
    /// Create the output artifact and bind `transcoder` to it
    ///
    /// No handler call happens here; a failure leaves the handler untouched.
    pub(crate) fn open(
        handler: H,
        output_path: &Path,
        mut transcoder: T,
        config: &ConverterConfig,
        source: String,
    ) -> Result<Self> {
        config.validate()?;

        if !transcoder.meta().is_recording() {
            return Err(ConvertError::InvalidConfig(
                "transcoder has already finished a session".to_string(),
            ));
        }

        let file = File::create(output_path).map_err(|source| ConvertError::CreateOutput {
            path: output_path.to_path_buf(),
            source,
        })?;

        transcoder.meta_mut().source = source;

        tracing::info!(
            output = %output_path.display(),
            source = %transcoder.meta().source,
            "Opened output artifact"
        );

        Ok(Self {
            output_path: output_path.to_path_buf(),
            handler,
            context: OnceLock::new(),
            transcoder: Mutex::new(transcoder),
            artifact: Mutex::new(Some(BufWriter::new(file))),
            delivery: Mutex::new(()),
            terminated: AtomicBool::new(false),
            mark_label: config.mark_label.clone(),
        })
    }

    /// Fire `on_started` and keep the returned context
    pub(crate) fn start(&self, session: SessionHandle) {
        let snapshot = self.meta();
        let context = self
            .handler
            .on_started(&self.output_path, &snapshot, session);

        // Each constructor starts its session exactly once
        let _ = self.context.set(context);
    }

    pub(crate) fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Snapshot of the transcoder's metadata
    pub(crate) fn meta(&self) -> TraceMeta {
        lock(&self.transcoder).meta().clone()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Feed one chunk to the transcoder, then notify progress
    ///
    /// An empty chunk still reaches the transcoder and still produces a
    /// progress notification. Chunks arriving after termination are dropped.
    pub(crate) fn process_chunk(&self, chunk: &[u8]) -> Result<()> {
        let _delivery = lock(&self.delivery);

        if self.is_terminated() {
            tracing::debug!(
                bytes = chunk.len(),
                "Dropping chunk received after termination"
            );
            return Ok(());
        }

        let snapshot = {
            let mut transcoder = lock(&self.transcoder);
            let mut artifact = lock(&self.artifact);
            match artifact.as_mut() {
                Some(out) => transcoder
                    .update(chunk, out)
                    .map_err(ConvertError::Transcode)?,
                None => return Ok(()),
            }
            transcoder.meta().clone()
        };

        tracing::trace!(
            output = %self.output_path.display(),
            bytes = chunk.len(),
            total = snapshot.input_bytes,
            "Processed chunk"
        );

        self.notify_progress(&snapshot);
        Ok(())
    }

    /// Append a manual mark stamped with the transcoder's logical clock
    pub(crate) fn add_mark(&self) {
        let mut transcoder = lock(&self.transcoder);
        let timestamp = transcoder.current_timestamp();
        transcoder
            .meta_mut()
            .add_mark(TraceMark::new(self.mark_label.clone(), timestamp));

        tracing::debug!(timestamp, label = %self.mark_label, "Inserted manual mark");
    }

    /// Run the termination sequence if it has not run yet
    ///
    /// The artifact is closed and both notifications fire even when flushing
    /// fails; the failure is returned afterwards. A panic in the final
    /// `on_progress` is resumed only after `on_ended` has fired.
    pub(crate) fn end_of_input(&self) -> Result<()> {
        let _delivery = lock(&self.delivery);

        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (snapshot, result) = {
            let mut transcoder = lock(&self.transcoder);
            let artifact = lock(&self.artifact).take();

            let result = match artifact {
                Some(mut out) => {
                    let flushed = transcoder.flush(&mut out);
                    let closed = close_artifact(out);
                    flushed.and(closed)
                }
                None => Ok(()),
            };

            (transcoder.meta().clone(), result)
        };

        tracing::info!(
            output = %self.output_path.display(),
            bytes = snapshot.input_bytes,
            marks = snapshot.marks().len(),
            "Recording finished"
        );

        let progress =
            panic::catch_unwind(AssertUnwindSafe(|| self.notify_progress(&snapshot)));
        if let Some(context) = self.context.get() {
            self.handler.on_ended(context);
        }
        if let Err(payload) = progress {
            panic::resume_unwind(payload);
        }

        result.map_err(ConvertError::Finalize)
    }

    /// Run termination from a teardown path, where errors can only be logged
    ///
    /// Handler panics are caught and logged too.
    pub(crate) fn end_quietly(&self) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.end_of_input())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                output = %self.output_path.display(),
                "Failed to finalize output artifact: {}",
                e
            ),
            Err(_) => tracing::warn!(
                output = %self.output_path.display(),
                "Handler panicked during termination"
            ),
        }
    }

    fn notify_progress(&self, meta: &TraceMeta) {
        if let Some(context) = self.context.get() {
            self.handler.on_progress(context, meta);
        }
    }
}

impl<H: TraceFileHandler, T: Transcoder> SessionControl for Session<H, T> {}

/// Flush buffered bytes and release the file handle
fn close_artifact(writer: BufWriter<File>) -> io::Result<()> {
    let mut file = writer.into_inner().map_err(|e| e.into_error())?;
    file.flush()?;
    drop(file);
    Ok(())
}

/// Converter whose input is pushed by its owner
///
/// Useful when the capture bytes arrive through a channel the caller already
/// manages. Cancellation and marks are no-ops.
///
/// # Example
///
/// ```no_run
/// use memtrace_convert::config::ConverterConfig;
/// use memtrace_convert::converter::{Converter, TraceConverter};
/// use memtrace_convert::handler::LoggingHandler;
/// use memtrace_convert::transcoder::PassthroughTranscoder;
///
/// let converter = TraceConverter::open(
///     LoggingHandler,
///     "capture.mtrace",
///     PassthroughTranscoder::default(),
///     ConverterConfig::default(),
/// )?;
///
/// converter.update(&[0x01, 0x02, 0x03])?;
/// converter.end_of_input()?;
/// assert!(converter.is_finished());
/// # Ok::<(), memtrace_convert::ConvertError>(())
/// ```
pub struct TraceConverter<H: TraceFileHandler, T: Transcoder> {
    session: Arc<Session<H, T>>,
}

impl<H: TraceFileHandler, T: Transcoder> TraceConverter<H, T> {
    /// Create the output artifact and notify `on_started`
    pub fn open(
        handler: H,
        output_path: impl AsRef<Path>,
        transcoder: T,
        config: ConverterConfig,
    ) -> Result<Self> {
        let source = config.source_label.clone();
        let session = Arc::new(Session::open(
            handler,
            output_path.as_ref(),
            transcoder,
            &config,
            source,
        )?);

        let control: Arc<dyn SessionControl> = session.clone();
        session.start(SessionHandle::new(Arc::downgrade(&control)));

        Ok(Self { session })
    }

    /// Feed a chunk through the transcoder and notify progress
    pub fn update(&self, chunk: &[u8]) -> Result<()> {
        self.session.process_chunk(chunk)
    }

    /// Run the termination sequence. Later calls are no-ops.
    pub fn end_of_input(&self) -> Result<()> {
        self.session.end_of_input()
    }

    /// Snapshot of the session metadata
    pub fn meta(&self) -> TraceMeta {
        self.session.meta()
    }
}

impl<H: TraceFileHandler, T: Transcoder> Converter for TraceConverter<H, T> {
    fn dispose(&self) {
        self.session.end_quietly();
    }

    fn output_path(&self) -> &Path {
        self.session.output_path()
    }

    fn is_finished(&self) -> bool {
        self.session.is_terminated()
    }
}

impl<H: TraceFileHandler, T: Transcoder> Drop for TraceConverter<H, T> {
    fn drop(&mut self) {
        self.dispose();
    }
}
