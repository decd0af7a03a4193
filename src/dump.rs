//! Offline conversion of a previously captured dump file
//!
//! A background thread reads the dump in buffer-sized chunks and feeds each
//! one through the session. Cancellation is cooperative: the flag is checked
//! after every processed chunk, so a chunk that is already being read is
//! always delivered before the loop stops.
//!
//! Unlike a socket disconnect, a failed read from a local file indicates a
//! real problem, so it is not absorbed. The input is closed and termination
//! runs first, then the error is returned from [`DumpConverter::join`].

use crate::config::ConverterConfig;
use crate::converter::{lock, Converter, Session, SessionControl, SessionHandle};
use crate::error::{ConvertError, Result};
use crate::handler::TraceFileHandler;
use crate::meta::TraceMeta;
use crate::transcoder::Transcoder;
use std::fs::File;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

struct DumpShared<H: TraceFileHandler, T: Transcoder> {
    session: Session<H, T>,
    dump_path: PathBuf,
    cancel_requested: AtomicBool,
}

impl<H: TraceFileHandler, T: Transcoder> DumpShared<H, T> {
    /// Body of the reader thread
    ///
    /// A panic in the loop is caught here so that termination runs after
    /// unwinding has finished, never from a destructor mid-unwind.
    fn run(&self, input: Box<dyn Read + Send>, buffer_size: usize) -> Result<()> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.read_loop(input, buffer_size))) {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    dump = %self.dump_path.display(),
                    "Dump reader panicked; ending session"
                );
                self.session.end_quietly();
                Err(ConvertError::ReaderPanicked)
            }
        }
    }

    fn read_loop(&self, input: Box<dyn Read + Send>, buffer_size: usize) -> Result<()> {
        let mut scope = ReadScope {
            input: Some(input),
            session: &self.session,
        };
        let mut buffer = vec![0u8; buffer_size];

        loop {
            let bytes_read = match scope.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ConvertError::ReadDump {
                        path: self.dump_path.clone(),
                        source,
                    })
                }
            };

            self.session.process_chunk(&buffer[..bytes_read])?;

            if self.cancel_requested.load(Ordering::SeqCst) {
                tracing::debug!(
                    dump = %self.dump_path.display(),
                    "Dump conversion cancelled"
                );
                break;
            }
        }

        scope.close()
    }
}

impl<H: TraceFileHandler, T: Transcoder> SessionControl for DumpShared<H, T> {
    fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }
}

/// Owns the open dump file for the lifetime of the read loop
///
/// Closing the input happens on every exit path. Termination runs through
/// [`ReadScope::close`] on success and from `Drop` on error; while unwinding
/// it is left to [`DumpShared::run`].
struct ReadScope<'a, H: TraceFileHandler, T: Transcoder> {
    input: Option<Box<dyn Read + Send>>,
    session: &'a Session<H, T>,
}

impl<H: TraceFileHandler, T: Transcoder> ReadScope<'_, H, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.input.as_mut() {
            Some(input) => input.read(buf),
            None => Ok(0),
        }
    }

    fn close(mut self) -> Result<()> {
        drop(self.input.take());
        self.session.end_of_input()
    }
}

impl<H: TraceFileHandler, T: Transcoder> Drop for ReadScope<'_, H, T> {
    fn drop(&mut self) {
        drop(self.input.take());
        if !thread::panicking() {
            self.session.end_quietly();
        }
    }
}

/// Converter replaying a dump file captured earlier
///
/// # Example
///
/// ```no_run
/// use memtrace_convert::config::ConverterConfig;
/// use memtrace_convert::dump::DumpConverter;
/// use memtrace_convert::handler::LoggingHandler;
/// use memtrace_convert::transcoder::PassthroughTranscoder;
///
/// let converter = DumpConverter::start(
///     LoggingHandler,
///     "session.dump",
///     "session.mtrace",
///     PassthroughTranscoder::default(),
///     ConverterConfig::default(),
/// )?;
///
/// converter.join()?;
/// # Ok::<(), memtrace_convert::ConvertError>(())
/// ```
pub struct DumpConverter<H: TraceFileHandler, T: Transcoder> {
    shared: Arc<DumpShared<H, T>>,
    reader: Mutex<Option<JoinHandle<Result<()>>>>,
    reader_id: ThreadId,
}

impl<H: TraceFileHandler, T: Transcoder> DumpConverter<H, T> {
    /// Open the dump file, create the output artifact, notify `on_started`,
    /// and start the background read loop
    ///
    /// The dump file is opened first, so a missing dump never truncates an
    /// existing artifact at `output_path`. Either failure is returned before
    /// any handler call.
    pub fn start(
        handler: H,
        dump_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
        transcoder: T,
        config: ConverterConfig,
    ) -> Result<Self> {
        let dump_path = dump_path.as_ref().to_path_buf();
        let input = File::open(&dump_path).map_err(|source| ConvertError::OpenDump {
            path: dump_path.clone(),
            source,
        })?;

        Self::from_reader(handler, input, dump_path, output_path, transcoder, config)
    }

    /// Like [`DumpConverter::start`], but reads from an already opened source
    ///
    /// `dump_path` only names the source in logs and errors.
    pub fn from_reader<R: Read + Send + 'static>(
        handler: H,
        input: R,
        dump_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
        transcoder: T,
        config: ConverterConfig,
    ) -> Result<Self> {
        let dump_path = dump_path.as_ref().to_path_buf();
        let input: Box<dyn Read + Send> = Box::new(input);
        let source = config.source_label.clone();
        let session = Session::open(handler, output_path.as_ref(), transcoder, &config, source)?;

        tracing::info!(
            dump = %dump_path.display(),
            output = %output_path.as_ref().display(),
            "Converting dump file"
        );

        let shared = Arc::new(DumpShared {
            session,
            dump_path,
            cancel_requested: AtomicBool::new(false),
        });

        let control: Arc<dyn SessionControl> = shared.clone();
        shared
            .session
            .start(SessionHandle::new(Arc::downgrade(&control)));

        let reader_shared = Arc::clone(&shared);
        let buffer_size = config.buffer_size;
        let reader = thread::Builder::new()
            .name("memtrace-dump".to_string())
            .spawn(move || reader_shared.run(input, buffer_size));

        match reader {
            Ok(reader) => Ok(Self {
                shared,
                reader_id: reader.thread().id(),
                reader: Mutex::new(Some(reader)),
            }),
            Err(e) => {
                shared.session.end_quietly();
                Err(ConvertError::Spawn(e))
            }
        }
    }

    /// Wait for the read loop to finish
    ///
    /// Returns the read or finalize error that stopped the loop, if any.
    /// Termination has always run by the time this returns. Later calls
    /// return `Ok(())`.
    pub fn join(&self) -> Result<()> {
        if thread::current().id() == self.reader_id {
            return Ok(());
        }

        let mut reader = lock(&self.reader);
        match reader.take() {
            Some(reader) => reader.join().unwrap_or(Err(ConvertError::ReaderPanicked)),
            None => Ok(()),
        }
    }

    pub fn dump_path(&self) -> &Path {
        &self.shared.dump_path
    }

    /// Snapshot of the session metadata
    pub fn meta(&self) -> TraceMeta {
        self.shared.session.meta()
    }
}

impl<H: TraceFileHandler, T: Transcoder> Converter for DumpConverter<H, T> {
    fn cancel(&self) {
        SessionControl::cancel(&*self.shared);
    }

    /// Stops the read loop at the next chunk boundary and waits for it
    fn dispose(&self) {
        self.cancel();

        if thread::current().id() == self.reader_id {
            return;
        }

        if let Err(e) = self.join() {
            tracing::warn!(
                dump = %self.shared.dump_path.display(),
                "Dump conversion failed: {}",
                e
            );
        }
        self.shared.session.end_quietly();
    }

    fn output_path(&self) -> &Path {
        self.shared.session.output_path()
    }

    fn is_finished(&self) -> bool {
        self.shared.session.is_terminated()
    }
}

impl<H: TraceFileHandler, T: Transcoder> Drop for DumpConverter<H, T> {
    fn drop(&mut self) {
        self.dispose();
    }
}
