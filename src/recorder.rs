//! Live capture from a connected socket
//!
//! A dedicated reader thread issues one receive at a time. Each completed
//! receive is handled the same way, whether it succeeded or not:
//!
//! 1. Deliver the byte count obtained (possibly zero) to the transcoder and
//!    notify progress.
//! 2. If bytes arrived and the socket is still connected, issue the next
//!    receive; otherwise release the socket and run termination.
//!
//! Receive errors (connection reset, forced close during shutdown, a socket
//! that was already released) are expected when the target process exits or
//! the user stops the recording, so they are absorbed and read as
//! end-of-stream.
//!
//! Cancelling closes the socket underneath the pending receive. The receive
//! then returns with an error or zero bytes and the normal completion path
//! above ends the session: cancellation is always observed by the reader,
//! never synchronously by the caller.

use crate::config::ConverterConfig;
use crate::converter::{lock, Converter, Session, SessionControl, SessionHandle};
use crate::error::{ConvertError, Result};
use crate::handler::TraceFileHandler;
use crate::meta::TraceMeta;
use crate::transcoder::Transcoder;
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

/// Connected byte source a recorder reads from
///
/// `receive` blocks until data arrives, the peer hangs up, or `close` is
/// called from another thread. `close` must be idempotent.
pub trait TraceSocket: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end-of-stream.
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn is_connected(&self) -> bool;

    /// Close the socket, unblocking any in-flight `receive`
    fn close(&self);

    /// Address of the remote end, recorded as the trace source
    fn peer_label(&self) -> Option<String> {
        None
    }
}

/// [`TraceSocket`] over a TCP connection handed off by a listener
#[derive(Debug)]
pub struct NetworkSocket {
    stream: TcpStream,
    open: AtomicBool,
}

impl NetworkSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            open: AtomicBool::new(true),
        }
    }
}

impl From<TcpStream> for NetworkSocket {
    fn from(stream: TcpStream) -> Self {
        Self::new(stream)
    }
}

impl TraceSocket for NetworkSocket {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_connected() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket already closed",
            ));
        }

        (&self.stream).read(buf)
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        // Shutting down both halves wakes a reader blocked in `receive`
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::debug!("Socket shutdown reported: {}", e);
        }
    }

    fn peer_label(&self) -> Option<String> {
        self.stream.peer_addr().ok().map(|addr| addr.to_string())
    }
}

/// State shared between the recorder, its reader thread and the session handle
struct RecorderShared<H: TraceFileHandler, T: Transcoder, S: TraceSocket> {
    session: Session<H, T>,
    /// Cleared once the socket has been closed and released
    socket: Mutex<Option<Arc<S>>>,
}

impl<H: TraceFileHandler, T: Transcoder, S: TraceSocket> RecorderShared<H, T, S> {
    /// Close and drop the socket. Only the first call does anything.
    fn release_socket(&self) {
        let mut socket = lock(&self.socket);
        if let Some(socket) = socket.take() {
            socket.close();
            tracing::debug!(
                output = %self.session.output_path().display(),
                "Released capture socket"
            );
        }
    }

    /// Handle one receive completion. Returns `true` when another receive
    /// should be issued.
    fn on_data_read(&self, chunk: &[u8], socket: Option<&S>) -> bool {
        if let Err(e) = self.session.process_chunk(chunk) {
            tracing::warn!(
                output = %self.session.output_path().display(),
                "Ending recording after transcoder failure: {}",
                e
            );
            return false;
        }

        let connected = socket.is_some_and(|s| s.is_connected());
        !chunk.is_empty() && connected
    }

    /// Body of the reader thread
    ///
    /// A panic in the loop is caught here so that termination runs after
    /// unwinding has finished, never from a destructor mid-unwind.
    fn run(&self, buffer_size: usize) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.read_loop(buffer_size))).is_err() {
            tracing::warn!(
                output = %self.session.output_path().display(),
                "Recorder thread panicked; ending session"
            );
            self.release_socket();
            self.session.end_quietly();
        }
    }

    fn read_loop(&self, buffer_size: usize) {
        let _end = EndOfInput { shared: self };
        let mut buffer = vec![0u8; buffer_size];

        loop {
            let socket = lock(&self.socket).clone();

            let bytes_read = match socket.as_deref() {
                Some(socket) => match socket.receive(&mut buffer) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("Receive failed, treating as end of stream: {}", e);
                        0
                    }
                },
                None => 0,
            };

            if !self.on_data_read(&buffer[..bytes_read], socket.as_deref()) {
                break;
            }
        }
    }
}

impl<H: TraceFileHandler, T: Transcoder, S: TraceSocket> SessionControl
    for RecorderShared<H, T, S>
{
    fn cancel(&self) {
        let socket = lock(&self.socket);
        if let Some(socket) = socket.as_ref() {
            tracing::debug!(
                output = %self.session.output_path().display(),
                "Cancelling recording"
            );
            socket.close();
        }
    }

    fn add_mark(&self) {
        self.session.add_mark();
    }
}

/// Releases the socket and runs termination when the reader exits
///
/// While unwinding only the socket is released; termination is left to
/// [`RecorderShared::run`].
struct EndOfInput<'a, H: TraceFileHandler, T: Transcoder, S: TraceSocket> {
    shared: &'a RecorderShared<H, T, S>,
}

impl<H: TraceFileHandler, T: Transcoder, S: TraceSocket> Drop for EndOfInput<'_, H, T, S> {
    fn drop(&mut self) {
        self.shared.release_socket();
        if !thread::panicking() {
            self.shared.session.end_quietly();
        }
    }
}

/// Converter recording from a live socket
///
/// # Example
///
/// ```no_run
/// use memtrace_convert::config::ConverterConfig;
/// use memtrace_convert::converter::Converter;
/// use memtrace_convert::handler::LoggingHandler;
/// use memtrace_convert::recorder::{NetworkSocket, TraceRecorder};
/// use memtrace_convert::transcoder::PassthroughTranscoder;
/// use std::net::TcpListener;
///
/// let listener = TcpListener::bind("0.0.0.0:9811")?;
/// let (stream, _) = listener.accept()?;
///
/// let recorder = TraceRecorder::start(
///     LoggingHandler,
///     NetworkSocket::new(stream),
///     "live.mtrace",
///     PassthroughTranscoder::default(),
///     ConverterConfig::default(),
/// )?;
///
/// recorder.add_mark();
/// recorder.join();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct TraceRecorder<H: TraceFileHandler, T: Transcoder, S: TraceSocket = NetworkSocket> {
    shared: Arc<RecorderShared<H, T, S>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_id: ThreadId,
}

impl<H: TraceFileHandler, T: Transcoder, S: TraceSocket> TraceRecorder<H, T, S> {
    /// Create the output artifact, notify `on_started`, and start reading
    ///
    /// The socket's peer address, when known, replaces the configured source
    /// label in the metadata.
    pub fn start(
        handler: H,
        socket: S,
        output_path: impl AsRef<Path>,
        transcoder: T,
        config: ConverterConfig,
    ) -> Result<Self> {
        let source = socket
            .peer_label()
            .unwrap_or_else(|| config.source_label.clone());

        let session = match Session::open(handler, output_path.as_ref(), transcoder, &config, source)
        {
            Ok(session) => session,
            Err(e) => {
                socket.close();
                return Err(e);
            }
        };

        let shared = Arc::new(RecorderShared {
            session,
            socket: Mutex::new(Some(Arc::new(socket))),
        });

        let control: Arc<dyn SessionControl> = shared.clone();
        shared
            .session
            .start(SessionHandle::new(Arc::downgrade(&control)));

        let reader_shared = Arc::clone(&shared);
        let buffer_size = config.buffer_size;
        let reader = thread::Builder::new()
            .name("memtrace-recorder".to_string())
            .spawn(move || reader_shared.run(buffer_size));

        match reader {
            Ok(reader) => Ok(Self {
                shared,
                reader_id: reader.thread().id(),
                reader: Mutex::new(Some(reader)),
            }),
            Err(e) => {
                shared.release_socket();
                shared.session.end_quietly();
                Err(ConvertError::Spawn(e))
            }
        }
    }

    /// Block until the reader thread has finished and termination has run
    ///
    /// Returns immediately when called from the reader thread itself or after
    /// an earlier join.
    pub fn join(&self) {
        self.join_reader();
    }

    /// Returns `false` when called from the reader thread, which will finish
    /// the session on its own once the current callback returns
    ///
    /// The handle stays locked while joining, so concurrent callers all
    /// return only after the reader has exited.
    fn join_reader(&self) -> bool {
        if thread::current().id() == self.reader_id {
            return false;
        }

        let mut reader = lock(&self.reader);
        if let Some(reader) = reader.take() {
            if reader.join().is_err() {
                tracing::warn!(
                    output = %self.shared.session.output_path().display(),
                    "Recorder thread panicked"
                );
            }
        }
        true
    }

    /// Snapshot of the session metadata
    pub fn meta(&self) -> TraceMeta {
        self.shared.session.meta()
    }
}

impl<H: TraceFileHandler, T: Transcoder, S: TraceSocket> Converter for TraceRecorder<H, T, S> {
    fn cancel(&self) {
        SessionControl::cancel(&*self.shared);
    }

    fn add_mark(&self) {
        SessionControl::add_mark(&*self.shared);
    }

    fn dispose(&self) {
        self.shared.release_socket();
        if self.join_reader() {
            self.shared.session.end_quietly();
        }
    }

    fn output_path(&self) -> &Path {
        self.shared.session.output_path()
    }

    fn is_finished(&self) -> bool {
        self.shared.session.is_terminated()
    }
}

impl<H: TraceFileHandler, T: Transcoder, S: TraceSocket> Drop for TraceRecorder<H, T, S> {
    fn drop(&mut self) {
        self.dispose();
    }
}
