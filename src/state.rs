//! Tracker lifecycle and process-wide state.
//!
//! Exactly one interception point exists per process, so the tracker is a
//! genuine singleton; it is still an ordinary struct so its transitions stay
//! testable against locally constructed instances.  All lifecycle mutation
//! goes through one atomic phase word with CAS transitions: pause and resume
//! are callable from inside the allocation path itself and must not take a
//! lock the calling thread could already hold, let alone one that allocates.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Context;
use libc::c_void;
use once_cell::sync::OnceCell;

use crate::recorder::Recorder;
use crate::reentry;
use crate::sink::{LineSink, OutputHandle, DEFAULT_QUEUE_CAPACITY};
use crate::warn::{WarningCallback, WarningChannel};

/// Callback invoked before any tracking state exists.  Memory it allocates is
/// never observed by the tracker.
pub type InitCallback = fn();

/// Callback invoked once tracking is active, with a handle to the open output
/// stream, so the host can emit header lines of its own before regular events
/// flow.  Memory it allocates is tracked like any other host allocation.
pub type InitializedCallback = fn(&OutputHandle);

/// Callback invoked exactly once after the output stream has been flushed and
/// closed; no further events arrive once it runs.
pub type StopCallback = fn();

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const ACTIVE: u8 = 2;
const PAUSED: u8 = 3;
const STOPPED: u8 = 4;

/// Lifecycle phase of a tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    Active,
    Paused,
    Stopped,
}

struct Lifecycle {
    phase: AtomicU8,
}

impl Lifecycle {
    fn new() -> Self {
        Lifecycle {
            phase: AtomicU8::new(UNINITIALIZED),
        }
    }

    fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            UNINITIALIZED => Phase::Uninitialized,
            INITIALIZING => Phase::Initializing,
            ACTIVE => Phase::Active,
            PAUSED => Phase::Paused,
            _ => Phase::Stopped,
        }
    }

    // First caller wins; everyone else observes a later phase.
    fn begin_init(&self) -> bool {
        self.phase
            .compare_exchange(
                UNINITIALIZED,
                INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn activate(&self) {
        self.phase.store(ACTIVE, Ordering::Release);
    }

    fn force_stop(&self) {
        self.phase.store(STOPPED, Ordering::Release);
    }

    fn pause(&self) {
        let _ = self
            .phase
            .compare_exchange(ACTIVE, PAUSED, Ordering::AcqRel, Ordering::Acquire);
    }

    fn resume(&self) {
        let _ = self
            .phase
            .compare_exchange(PAUSED, ACTIVE, Ordering::AcqRel, Ordering::Acquire);
    }

    // True for exactly one caller, who then owns teardown.
    fn stop(&self) -> bool {
        loop {
            let current = self.phase.load(Ordering::Acquire);
            if current != ACTIVE && current != PAUSED {
                return false;
            }
            if self
                .phase
                .compare_exchange(current, STOPPED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

struct Session {
    sink: LineSink,
    on_stop: Option<StopCallback>,
}

/// A heap-event tracker: lifecycle state machine, event recorder, output sink
/// and warning channel under one roof.
///
/// The crate-level free functions drive one process-wide instance; the type is
/// public so the state machine can be exercised against throwaway instances.
pub struct Tracker {
    lifecycle: Lifecycle,
    recorder: Recorder,
    warnings: Arc<WarningChannel>,
    module_generation: AtomicU64,
    session: OnceCell<Session>,
}

impl Tracker {
    pub fn new() -> Self {
        Tracker {
            lifecycle: Lifecycle::new(),
            recorder: Recorder::new(),
            warnings: Arc::new(WarningChannel::new()),
            module_generation: AtomicU64::new(0),
            session: OnceCell::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    /// Start tracking into the file at `output_path` (`%p` expands to the
    /// process id).  See [`crate::init`] for the callback handshake.
    pub fn init<P: AsRef<Path>>(
        &self,
        output_path: P,
        before: Option<InitCallback>,
        after: Option<InitializedCallback>,
        on_stop: Option<StopCallback>,
    ) {
        let output_path = output_path.as_ref().to_path_buf();
        self.init_impl(
            move || {
                let output_path = expand_target(&output_path);
                let file = File::create(&output_path).with_context(|| {
                    format!("cannot open output target {}", output_path.display())
                })?;
                Ok(Box::new(file))
            },
            before,
            after,
            on_stop,
        );
    }

    /// Start tracking into a caller-supplied stream instead of a file.
    pub fn init_with_writer<W>(
        &self,
        writer: W,
        before: Option<InitCallback>,
        after: Option<InitializedCallback>,
        on_stop: Option<StopCallback>,
    ) where
        W: Write + Send + 'static,
    {
        self.init_impl(move || Ok(Box::new(writer)), before, after, on_stop);
    }

    fn init_impl<F>(
        &self,
        open: F,
        before: Option<InitCallback>,
        after: Option<InitializedCallback>,
        on_stop: Option<StopCallback>,
    ) where
        F: FnOnce() -> anyhow::Result<Box<dyn Write + Send>>,
    {
        if !self.lifecycle.begin_init() {
            self.warnings.emit(format_args!(
                "heap_stream: already initialized, ignoring repeated init"
            ));
            return;
        }
        // Runs while still Initializing: whatever it allocates can never be
        // attributed to the host, because recording is gated on Active/Paused.
        if let Some(before) = before {
            before();
        }
        let sink = open().and_then(|writer| {
            LineSink::spawn(writer, queue_capacity(), Arc::clone(&self.warnings))
                .context("cannot start the sink thread")
        });
        let sink = match sink {
            Ok(sink) => sink,
            Err(err) => {
                self.warnings.emit(format_args!(
                    "heap_stream: {:#}, tracking is disabled",
                    err
                ));
                self.lifecycle.force_stop();
                return;
            }
        };
        self.recorder.write_header(&sink);
        let handle = OutputHandle::new(sink.clone());
        let _ = self.session.set(Session { sink, on_stop });
        self.lifecycle.activate();
        if let Some(after) = after {
            after(&handle);
        }
    }

    /// Stop tracking: flush and close the sink, then run the stop callback.
    /// Exactly one caller performs the teardown; all others no-op.
    pub fn stop(&self) {
        if !self.lifecycle.stop() {
            return;
        }
        let anomalies = self.recorder.anomalies();
        if anomalies > 0 {
            self.warnings.emit(format_args!(
                "heap_stream: {} free/realloc calls referenced addresses with no live allocation",
                anomalies
            ));
        }
        if let Some(session) = self.session.get() {
            session.sink.close();
            if let Some(on_stop) = session.on_stop {
                on_stop();
            }
        }
    }

    /// Suspend record emission.  Bookkeeping continues so that later free and
    /// realloc records stay correct.  Callable from any thread, including from
    /// inside the allocation path.
    pub fn pause(&self) {
        self.lifecycle.pause();
    }

    /// Resume record emission after [`Tracker::pause`].
    pub fn resume(&self) {
        self.lifecycle.resume();
    }

    /// Report an allocation of `size` bytes at `ptr`.
    pub fn record_malloc(&self, ptr: *mut c_void, size: usize) {
        let emitting = match self.emission_gate() {
            Some(emitting) => emitting,
            None => return,
        };
        let _guard = match reentry::enter() {
            Some(guard) => guard,
            None => return,
        };
        self.recorder
            .on_malloc(ptr as usize, size, self.emit_sink(emitting));
    }

    /// Report a deallocation of `ptr`.  Null is accepted and ignored.
    pub fn record_free(&self, ptr: *mut c_void) {
        let emitting = match self.emission_gate() {
            Some(emitting) => emitting,
            None => return,
        };
        let _guard = match reentry::enter() {
            Some(guard) => guard,
            None => return,
        };
        self.recorder.on_free(ptr as usize, self.emit_sink(emitting));
    }

    /// Report a reallocation of `old` to `size` bytes now living at `new`.
    pub fn record_realloc(&self, old: *mut c_void, size: usize, new: *mut c_void) {
        let emitting = match self.emission_gate() {
            Some(emitting) => emitting,
            None => return,
        };
        let _guard = match reentry::enter() {
            Some(guard) => guard,
            None => return,
        };
        self.recorder
            .on_realloc(old as usize, size, new as usize, self.emit_sink(emitting));
    }

    // Active: record and emit.  Paused: record silently.  Otherwise: ignore.
    fn emission_gate(&self) -> Option<bool> {
        match self.lifecycle.phase() {
            Phase::Active => Some(true),
            Phase::Paused => Some(false),
            _ => None,
        }
    }

    fn emit_sink(&self, emitting: bool) -> Option<&LineSink> {
        if emitting {
            self.session.get().map(|session| &session.sink)
        } else {
            None
        }
    }

    /// Mark every cached module-to-address mapping as stale.  A single atomic
    /// increment, safe from loader notification callbacks and signal context.
    pub fn invalidate_module_cache(&self) {
        self.module_generation.fetch_add(1, Ordering::Release);
    }

    /// Current module-cache generation.  Consumers resolving addresses to
    /// modules must discard anything cached under an older generation.
    pub fn module_cache_generation(&self) -> u64 {
        self.module_generation.load(Ordering::Acquire)
    }

    /// Replace the warning callback.  `None` drops diagnostics silently.
    pub fn set_warning_callback(&self, callback: Option<WarningCallback>) {
        self.warnings.set(callback);
    }

    #[cfg(test)]
    pub(crate) fn recorder(&self) -> &Recorder {
        &self.recorder
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Tracker::new()
    }
}

// Expand `%p` in the target path to the current process id, so a tracked
// program can be re-run without clobbering the previous stream.
fn expand_target(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw.contains("%p") {
        PathBuf::from(raw.replace("%p", &process::id().to_string()))
    } else {
        path.to_path_buf()
    }
}

fn queue_capacity() -> usize {
    std::env::var("HEAP_STREAM_QUEUE_CAPACITY")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .filter(|&capacity| capacity > 0)
        .unwrap_or(DEFAULT_QUEUE_CAPACITY)
}
