//! `heap_stream` tracks every memory allocation, deallocation, and
//! reallocation a running program performs and streams one compact record per
//! event to a line-oriented sink, for later analysis of memory usage over
//! time, leak detection, or allocation hot spots.  It is the in-process
//! tracking engine only: it runs on whichever host thread happens to allocate,
//! never blocks that thread on sink I/O, never reports its own bookkeeping
//! allocations, and never lets an internal failure escape into the host's
//! control flow.
//!
//! ## Enabling `heap_stream` in a Rust program
//!
//! Install [`StreamAllocator`] as the global allocator and start a tracking
//! session.  Until [`init`] runs, the allocator is a plain passthrough to
//! [`std::alloc::System`]:
//!
//! ```
//! use heap_stream::StreamAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: StreamAllocator = StreamAllocator;
//!
//! fn main() {}
//! ```
//!
//! ```no_run
//! use heap_stream::StreamAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: StreamAllocator = StreamAllocator;
//!
//! fn main() {
//!     // `%p` expands to the process id.
//!     heap_stream::init("trace.%p.hs", None, None, None);
//!     let _data = vec![0u8; 4096];
//!     heap_stream::stop();
//! }
//! ```
//!
//! Programs intercepted by other means (preload shims, allocator middleware)
//! drive the same three hooks directly: [`record_malloc`], [`record_free`],
//! and [`record_realloc`].  The interposition mechanism itself is host
//! plumbing and out of scope here.
//!
//! ## The stream
//!
//! Each record is one line of lowercase hex fields:
//!
//! ```text
//! h <version> <pid>                          stream header
//! + <seq> <tid> <addr> <size>                allocation
//! - <seq> <tid> <addr> <size>                deallocation
//! ~ <seq> <tid> <old> <oldsize> <new> <size> reallocation
//! ```
//!
//! Sequence numbers are strictly increasing process-wide; records from one
//! thread appear in program order, and consumers merge across threads by
//! sorting on `seq`.  Free and realloc records carry the sizes of the
//! allocations they retire, reconstructed from the tracker's live-address
//! table, so the stream alone suffices for exact heap accounting.
//!
//! ## Diagnostics
//!
//! The tracker never prints on its own.  Internal anomalies (an output target
//! that cannot be opened, events dropped under sink backpressure) go to a
//! best-effort warning callback:
//!
//! ```
//! fn print_warning(args: std::fmt::Arguments) {
//!     eprintln!("{}", args);
//! }
//!
//! heap_stream::set_warning_callback(Some(print_warning));
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_void;
use once_cell::sync::Lazy;

mod alloc;
mod recorder;
mod reentry;
mod sink;
mod state;
mod warn;

pub use crate::alloc::StreamAllocator;
pub use crate::sink::OutputHandle;
pub use crate::state::{InitCallback, InitializedCallback, Phase, StopCallback, Tracker};
pub use crate::warn::WarningCallback;

static TRACKER: Lazy<Tracker> = Lazy::new(Tracker::new);

// The record hooks below may be invoked by a global allocator before anything
// else in the process has run.  Constructing the tracker allocates, so the
// hooks must not force the Lazy themselves: they bail out until some control
// operation has built the tracker and flipped this flag.
static TRACKER_READY: AtomicBool = AtomicBool::new(false);

fn tracker() -> &'static Tracker {
    let tracker = &*TRACKER;
    TRACKER_READY.store(true, Ordering::Release);
    tracker
}

/// Start the process-wide tracking session.
///
/// Callable at most once per process; concurrent and repeated calls warn and
/// return without effect.  The handshake runs in order:
///
/// 1. `before` fires while no tracking capability exists, so setup work it
///    performs is never observed as host memory use;
/// 2. `output_path` is resolved (`%p` expands to the process id) and opened,
///    and the sink thread starts;
/// 3. tracking becomes active and `after` receives the [`OutputHandle`], so
///    the host can write custom header lines before regular events flow.
///
/// If the target cannot be opened the tracker reports one warning and falls
/// back to a permanently inert mode; the host is never disturbed.
pub fn init<P: AsRef<Path>>(
    output_path: P,
    before: Option<InitCallback>,
    after: Option<InitializedCallback>,
    on_stop: Option<StopCallback>,
) {
    tracker().init(output_path, before, after, on_stop);
}

/// Like [`init`], but streams into a caller-supplied writer (a pipe, a
/// socket) instead of a file path.
pub fn init_with_writer<W>(
    writer: W,
    before: Option<InitCallback>,
    after: Option<InitializedCallback>,
    on_stop: Option<StopCallback>,
) where
    W: std::io::Write + Send + 'static,
{
    tracker().init_with_writer(writer, before, after, on_stop);
}

/// Stop tracking: drain and close the sink, then invoke the stop callback
/// exactly once.  Subsequent events are dropped; repeated calls are no-ops.
pub fn stop() {
    tracker().stop();
}

/// Suspend record emission.  The live-address table stays current while
/// paused, so records emitted after [`resume`] remain correct.  Safe to call
/// from any thread, including from inside the allocation path.
pub fn pause() {
    tracker().pause();
}

/// Resume record emission after [`pause`].
pub fn resume() {
    tracker().resume();
}

/// Report an allocation of `size` bytes at `ptr`.  Best-effort: a no-op
/// before [`init`], while paused or stopped, and for nested calls made by the
/// tracker's own machinery.
pub fn record_malloc(ptr: *mut c_void, size: usize) {
    if !TRACKER_READY.load(Ordering::Acquire) {
        return;
    }
    TRACKER.record_malloc(ptr, size);
}

/// Report a deallocation of `ptr`.  Free of null is accepted and ignored.
pub fn record_free(ptr: *mut c_void) {
    if !TRACKER_READY.load(Ordering::Acquire) {
        return;
    }
    TRACKER.record_free(ptr);
}

/// Report a reallocation of `old` to `size` bytes now living at `new`.
/// `record_realloc(null, size, new)` is equivalent to
/// `record_malloc(new, size)`.
pub fn record_realloc(old: *mut c_void, size: usize, new: *mut c_void) {
    if !TRACKER_READY.load(Ordering::Acquire) {
        return;
    }
    TRACKER.record_realloc(old, size, new);
}

/// Signal that the set of loaded modules changed (a shared component was
/// loaded or unloaded).  Bumps the generation counter consumers use to detect
/// stale module-to-address caches; a single atomic increment, safe from
/// loader callbacks and signal context.
pub fn invalidate_module_cache() {
    if TRACKER_READY.load(Ordering::Acquire) {
        TRACKER.invalidate_module_cache();
    }
}

/// Current module-cache generation; `0` until the tracker exists.
pub fn module_cache_generation() -> u64 {
    if TRACKER_READY.load(Ordering::Acquire) {
        TRACKER.module_cache_generation()
    } else {
        0
    }
}

/// Register the warning callback, replacing any previous one.  `None` means
/// diagnostics are silently dropped.
pub fn set_warning_callback(callback: Option<WarningCallback>) {
    tracker().set_warning_callback(callback);
}
