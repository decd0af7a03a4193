// Integration test utilities
//
// Recording handler, scripted sockets and readers shared by the session tests

#![allow(dead_code)]

use memtrace_convert::converter::SessionHandle;
use memtrace_convert::handler::TraceFileHandler;
use memtrace_convert::meta::TraceMeta;
use memtrace_convert::recorder::TraceSocket;
use memtrace_convert::transcoder::{PassthroughTranscoder, Transcoder};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One handler notification
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started { source: String },
    Progress { bytes: u64, marks: usize },
    Ended { artifact_len: u64 },
}

/// Handler that records every notification in order
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
    session: Mutex<Option<SessionHandle>>,
    /// Cancel through the session handle once this many progress
    /// notifications have arrived
    cancel_after: Option<usize>,
    /// Insert a mark through the session handle on every progress
    mark_on_progress: bool,
    /// Panic after recording every progress notification
    panic_on_progress: bool,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancelling_after(progress: usize) -> Arc<Self> {
        Arc::new(Self {
            cancel_after: Some(progress),
            ..Self::default()
        })
    }

    pub fn marking() -> Arc<Self> {
        Arc::new(Self {
            mark_on_progress: true,
            ..Self::default()
        })
    }

    pub fn panicking() -> Arc<Self> {
        Arc::new(Self {
            panic_on_progress: true,
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.session.lock().unwrap().clone()
    }

    pub fn progress_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Progress { .. }))
            .count()
    }

    pub fn ended_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Ended { .. }))
            .count()
    }

    /// Block until `predicate` holds for the recorded events
    pub fn wait_until(&self, predicate: impl Fn(&[Event]) -> bool) {
        let events = self.events.lock().unwrap();
        let (_events, timeout) = self
            .changed
            .wait_timeout_while(events, Duration::from_secs(10), |events| {
                !predicate(events)
            })
            .unwrap();
        assert!(!timeout.timed_out(), "timed out waiting for handler events");
    }

    pub fn wait_for_progress(&self, count: usize) {
        self.wait_until(|events| {
            events
                .iter()
                .filter(|e| matches!(e, Event::Progress { .. }))
                .count()
                >= count
        });
    }

    pub fn wait_for_end(&self) {
        self.wait_until(|events| events.iter().any(|e| matches!(e, Event::Ended { .. })));
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_all();
    }
}

impl TraceFileHandler for RecordingHandler {
    type Context = PathBuf;

    fn on_started(&self, output_path: &Path, meta: &TraceMeta, session: SessionHandle) -> PathBuf {
        *self.session.lock().unwrap() = Some(session);
        self.push(Event::Started {
            source: meta.source.clone(),
        });
        output_path.to_path_buf()
    }

    fn on_progress(&self, _context: &PathBuf, meta: &TraceMeta) {
        self.push(Event::Progress {
            bytes: meta.input_bytes,
            marks: meta.marks().len(),
        });

        if self.panic_on_progress {
            panic!("handler rejected progress");
        }

        let session = self.session();
        if let Some(session) = session {
            if self.mark_on_progress {
                session.add_mark();
            }
            if Some(self.progress_count()) == self.cancel_after {
                session.cancel();
            }
        }
    }

    fn on_ended(&self, context: &PathBuf) {
        // The artifact must already be closed and complete on disk
        let artifact_len = std::fs::metadata(context).map(|m| m.len()).unwrap_or(0);
        self.push(Event::Ended { artifact_len });
    }
}

/// Scripted socket behaviour for one `receive` call
#[derive(Debug, Clone)]
pub enum Step {
    Data(Vec<u8>),
    Fail(io::ErrorKind),
    /// Block until the socket is closed, then fail like a forced close
    Block,
}

#[derive(Default)]
struct SocketState {
    steps: Mutex<VecDeque<Step>>,
    open: AtomicBool,
    closed: Mutex<bool>,
    closed_cv: Condvar,
    close_calls: AtomicUsize,
    shutdowns: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    receives: AtomicUsize,
}

/// In-memory [`TraceSocket`] replaying a fixed script
///
/// Clones share state, so a test can keep one clone to inspect the socket
/// after handing the other to a recorder. An exhausted script reads as a
/// graceful end-of-stream.
#[derive(Clone)]
pub struct ScriptedSocket {
    state: Arc<SocketState>,
    peer: Option<String>,
}

impl ScriptedSocket {
    pub fn new(steps: Vec<Step>) -> Self {
        let state = SocketState {
            steps: Mutex::new(steps.into()),
            open: AtomicBool::new(true),
            ..SocketState::default()
        };
        Self {
            state: Arc::new(state),
            peer: Some("10.1.2.3:9811".to_string()),
        }
    }

    pub fn without_peer(mut self) -> Self {
        self.peer = None;
        self
    }

    /// Number of times `close` was called
    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Number of times the socket actually transitioned to closed
    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn receives(&self) -> usize {
        self.state.receives.load(Ordering::SeqCst)
    }

    fn wait_closed(&self) {
        let closed = self.state.closed.lock().unwrap();
        let _closed = self
            .state
            .closed_cv
            .wait_while(closed, |closed| !*closed)
            .unwrap();
    }
}

impl TraceSocket for ScriptedSocket {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let in_flight = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.state.receives.fetch_add(1, Ordering::SeqCst);

        let step = self.state.steps.lock().unwrap().pop_front();
        let result = match step {
            Some(Step::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
            Some(Step::Block) => {
                self.wait_closed();
                Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "closed while receiving",
                ))
            }
            None => Ok(0),
        };

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_connected(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.open.swap(false, Ordering::SeqCst) {
            self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        *self.state.closed.lock().unwrap() = true;
        self.state.closed_cv.notify_all();
    }

    fn peer_label(&self) -> Option<String> {
        self.peer.clone()
    }
}

/// Reader that hands out chunks sent over a channel
///
/// Each `read` blocks until the test sends the next item; a dropped sender
/// reads as end-of-file.
pub struct ChannelReader {
    chunks: Receiver<io::Result<Vec<u8>>>,
    reads: Arc<AtomicUsize>,
}

impl ChannelReader {
    pub fn new(chunks: Receiver<io::Result<Vec<u8>>>) -> Self {
        Self {
            chunks,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of `read` calls started so far
    pub fn reads(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

/// Spin until `counter` reaches `target`
pub fn wait_for_count(counter: &AtomicUsize, target: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::SeqCst) < target {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for reads"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.chunks.recv() {
            Ok(Ok(chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(0),
        }
    }
}

/// Reader that yields `good` bytes, then fails
pub struct FailingReader {
    data: io::Cursor<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl FailingReader {
    pub fn new(good: Vec<u8>) -> (Self, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                data: io::Cursor::new(good),
                closed: Arc::clone(&closed),
            },
            closed,
        )
    }
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.data.read(buf)? {
            0 => Err(io::Error::new(io::ErrorKind::InvalidData, "bad sector")),
            n => Ok(n),
        }
    }
}

impl Drop for FailingReader {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fault injected by [`FaultyTranscoder`]
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Reject the n-th `update` call (1-based) with `InvalidData`
    FailUpdate(usize),
    /// Panic on the n-th `update` call (1-based)
    PanicUpdate(usize),
    /// Fail `flush`
    FailFlush,
}

/// Passthrough transcoder with one injected fault
pub struct FaultyTranscoder {
    inner: PassthroughTranscoder,
    fault: Fault,
    updates: usize,
}

impl FaultyTranscoder {
    pub fn new(fault: Fault) -> Self {
        Self {
            inner: PassthroughTranscoder::default(),
            fault,
            updates: 0,
        }
    }
}

impl Transcoder for FaultyTranscoder {
    fn meta(&self) -> &TraceMeta {
        self.inner.meta()
    }

    fn meta_mut(&mut self) -> &mut TraceMeta {
        self.inner.meta_mut()
    }

    fn update(&mut self, chunk: &[u8], out: &mut dyn Write) -> io::Result<()> {
        self.updates += 1;
        match self.fault {
            Fault::FailUpdate(n) if n == self.updates => {
                Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame"))
            }
            Fault::PanicUpdate(n) if n == self.updates => panic!("corrupt frame header"),
            _ => self.inner.update(chunk, out),
        }
    }

    fn flush(&mut self, out: &mut dyn Write) -> io::Result<()> {
        match self.fault {
            Fault::FailFlush => Err(io::Error::new(io::ErrorKind::Other, "flush failed")),
            _ => self.inner.flush(out),
        }
    }

    fn current_timestamp(&self) -> u64 {
        self.inner.current_timestamp()
    }
}
