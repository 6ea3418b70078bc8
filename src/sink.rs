//! Line-oriented output sink.
//!
//! Serialized records are pushed onto a bounded lock-free queue and drained by
//! a single background thread that owns the buffered writer.  The submitting
//! side never blocks: when the queue is full the newest line is dropped and a
//! counter bumped, because the submitter is, transitively, the host's own
//! allocation call.  Lines are always whole; relative order across threads is
//! whatever order the pushes linearized in, which is why records carry their
//! own sequence numbers.

use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::reentry;
use crate::warn::WarningChannel;

/// Default capacity of the line queue, overridable at `init` time through the
/// `HEAP_STREAM_QUEUE_CAPACITY` environment variable.
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 16 * 1024;

/// How long the flusher sleeps when the queue stays empty and nobody wakes it.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct SinkInner {
    queue: ArrayQueue<String>,
    closed: AtomicBool,
    dropped: AtomicU64,
    write_failed: AtomicBool,
    flush_requested: AtomicBool,
    wake: OnceCell<Thread>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    warnings: Arc<WarningChannel>,
}

/// Handle to the sink, freely clonable across threads.
#[derive(Clone)]
pub(crate) struct LineSink {
    inner: Arc<SinkInner>,
}

impl LineSink {
    /// Start a sink draining into `writer` on a dedicated thread.
    pub(crate) fn spawn<W>(
        writer: W,
        capacity: usize,
        warnings: Arc<WarningChannel>,
    ) -> io::Result<LineSink>
    where
        W: Write + Send + 'static,
    {
        let inner = Arc::new(SinkInner {
            queue: ArrayQueue::new(capacity),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            write_failed: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            wake: OnceCell::new(),
            flusher: Mutex::new(None),
            warnings,
        });
        let drain_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("heap-stream-io".to_string())
            .spawn(move || drain_loop(drain_inner, writer))?;
        let _ = inner.wake.set(handle.thread().clone());
        *inner.flusher.lock() = Some(handle);
        Ok(LineSink { inner })
    }

    /// Append one already-terminated line.  Never blocks; after `close` or on
    /// a full queue the line is discarded.
    pub(crate) fn submit(&self, line: String) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        if inner.queue.push(line).is_err() {
            if inner.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                inner
                    .warnings
                    .emit(format_args!("heap_stream: output queue full, dropping newest events"));
            }
            return;
        }
        if let Some(flusher) = inner.wake.get() {
            flusher.unpark();
        }
    }

    /// Ask the flusher to push buffered lines to the underlying medium.
    pub(crate) fn request_flush(&self) {
        self.inner.flush_requested.store(true, Ordering::Release);
        if let Some(flusher) = self.inner.wake.get() {
            flusher.unpark();
        }
    }

    /// Drain outstanding lines, flush, and shut the flusher down.  Later
    /// submissions are rejected.  Idempotent; only the first caller joins.
    pub(crate) fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(flusher) = inner.wake.get() {
            flusher.unpark();
        }
        let handle = inner.flusher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let dropped = inner.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            inner.warnings.emit(format_args!(
                "heap_stream: {} events were dropped on output queue overflow",
                dropped
            ));
        }
    }

    #[cfg(test)]
    pub(crate) fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

fn drain_loop<W: Write>(inner: Arc<SinkInner>, writer: W) {
    // Lines drained here were allocated on recording threads; freeing them on
    // this thread must never surface as host events.
    reentry::exclude_current_thread();
    let mut writer = BufWriter::new(writer);
    loop {
        let mut wrote = false;
        while let Some(line) = inner.queue.pop() {
            wrote = true;
            if inner.write_failed.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(err) = writer.write_all(line.as_bytes()) {
                note_write_failure(&inner, &err);
            }
        }
        // Buffered writers surface medium errors at flush time, so flush
        // outcomes are tracked the same way as writes.
        if (wrote || inner.flush_requested.swap(false, Ordering::AcqRel))
            && !inner.write_failed.load(Ordering::Relaxed)
        {
            if let Err(err) = writer.flush() {
                note_write_failure(&inner, &err);
            }
        }
        if inner.closed.load(Ordering::Acquire) && inner.queue.is_empty() {
            break;
        }
        thread::park_timeout(POLL_INTERVAL);
    }
    if !inner.write_failed.load(Ordering::Relaxed) {
        let _ = writer.flush();
    }
}

fn note_write_failure(inner: &SinkInner, err: &io::Error) {
    inner.write_failed.store(true, Ordering::Relaxed);
    inner.warnings.emit(format_args!(
        "heap_stream: writing to the output sink failed ({}), discarding further events",
        err
    ));
}

/// Handle to the open output stream, given to the post-initialization callback
/// so the host can emit its own header lines before regular events flow.
/// Valid until the tracker stops; later writes are rejected, not fatal.
#[derive(Clone)]
pub struct OutputHandle {
    sink: LineSink,
}

impl OutputHandle {
    pub(crate) fn new(sink: LineSink) -> Self {
        OutputHandle { sink }
    }

    /// Append `line` as one whole line, normalizing the trailing newline.
    pub fn write_line(&self, line: &str) {
        let mut owned = String::with_capacity(line.len() + 1);
        owned.push_str(line.trim_end_matches('\n'));
        owned.push('\n');
        self.sink.submit(owned);
    }

    /// Request that buffered lines reach the underlying medium.  The flush
    /// happens on the sink's own thread and does not block the caller.
    pub fn flush(&self) {
        self.sink.request_flush();
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{channel, Receiver, Sender};

    use super::*;
    use crate::test_util::SharedBuf;

    fn silent(_args: fmt::Arguments<'_>) {}

    fn channel_with(callback: crate::warn::WarningCallback) -> Arc<WarningChannel> {
        let warnings = Arc::new(WarningChannel::new());
        warnings.set(Some(callback));
        warnings
    }

    #[test]
    fn lines_come_out_in_submission_order() {
        let buf = SharedBuf::default();
        let sink = LineSink::spawn(buf.clone(), 64, channel_with(silent)).unwrap();
        sink.submit("a 1\n".to_string());
        sink.submit("b 2\n".to_string());
        sink.submit("c 3\n".to_string());
        sink.close();
        assert_eq!(buf.contents(), "a 1\nb 2\nc 3\n");
    }

    #[test]
    fn close_rejects_later_writes() {
        let buf = SharedBuf::default();
        let sink = LineSink::spawn(buf.clone(), 64, channel_with(silent)).unwrap();
        sink.submit("kept\n".to_string());
        sink.close();
        sink.submit("discarded\n".to_string());
        sink.close();
        assert_eq!(buf.contents(), "kept\n");
    }

    #[test]
    fn output_handle_normalizes_newlines() {
        let buf = SharedBuf::default();
        let sink = LineSink::spawn(buf.clone(), 64, channel_with(silent)).unwrap();
        let handle = OutputHandle::new(sink.clone());
        handle.write_line("no newline");
        handle.write_line("one newline\n");
        handle.flush();
        sink.close();
        assert_eq!(buf.contents(), "no newline\none newline\n");
    }

    // Writer that signals when the first write starts and then blocks until
    // released, so the queue can be filled deterministically behind it.
    struct GatedWriter {
        buf: SharedBuf,
        started: Sender<()>,
        release: Receiver<()>,
        blocked_once: bool,
    }

    impl Write for GatedWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if !self.blocked_once {
                self.blocked_once = true;
                let _ = self.started.send(());
                let _ = self.release.recv();
            }
            self.buf.write(data)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    static OVERFLOW_WARNINGS: AtomicUsize = AtomicUsize::new(0);

    fn count_overflow(args: fmt::Arguments<'_>) {
        let rendered = args.to_string();
        if rendered.contains("queue full") || rendered.contains("dropped") {
            OVERFLOW_WARNINGS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn overflow_drops_newest_and_warns_once() {
        let buf = SharedBuf::default();
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel();
        let writer = GatedWriter {
            buf: buf.clone(),
            started: started_tx,
            release: release_rx,
            blocked_once: false,
        };
        let sink = LineSink::spawn(writer, 2, channel_with(count_overflow)).unwrap();

        // First line is popped by the flusher, which then blocks inside the
        // writer while holding it.
        sink.submit("a\n".to_string());
        started_rx.recv().unwrap();
        // These fill the two queue slots behind the stuck flusher.
        sink.submit("b\n".to_string());
        sink.submit("c\n".to_string());
        // No room left: dropped, with a single warning for the whole burst.
        sink.submit("d\n".to_string());
        sink.submit("e\n".to_string());
        assert_eq!(sink.dropped(), 2);

        release_tx.send(()).unwrap();
        sink.close();
        assert_eq!(buf.contents(), "a\nb\nc\n");
        // One warning at first drop, one coalesced total at close.
        assert_eq!(OVERFLOW_WARNINGS.load(Ordering::SeqCst), 2);
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _data: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "medium gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    static WRITE_FAILURES: AtomicUsize = AtomicUsize::new(0);

    fn count_write_failure(args: fmt::Arguments<'_>) {
        if args.to_string().contains("writing to the output sink failed") {
            WRITE_FAILURES.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn write_errors_warn_once_and_do_not_block() {
        let sink = LineSink::spawn(FailingWriter, 64, channel_with(count_write_failure)).unwrap();
        sink.submit("x\n".to_string());
        sink.submit("y\n".to_string());
        sink.submit("z\n".to_string());
        sink.close();
        assert_eq!(WRITE_FAILURES.load(Ordering::SeqCst), 1);
    }
}
