//! Event recorder.
//!
//! Turns raw malloc/free/realloc notifications into serialized records.  A
//! sharded concurrent table maps each live address to its size, so free and
//! realloc records can carry the size of the allocation they retire even
//! though the notification itself does not.  Host bugs (double free, free of
//! an address nobody allocated) are data-quality issues in the stream, never
//! errors: the affected record is written with size `0` and a counter bumped.
//!
//! Record grammar, one event per line, all fields lowercase hex:
//!
//! ```text
//! h <version> <pid>                          stream header
//! + <seq> <tid> <addr> <size>                allocation
//! - <seq> <tid> <addr> <size>                deallocation
//! ~ <seq> <tid> <old> <oldsize> <new> <size> reallocation
//! ```
//!
//! Sequence numbers are assigned at emission time from one process-global
//! counter, so the emitted stream is gap-free and strictly increasing; lines
//! from different threads may appear out of sequence-number order in the sink
//! and consumers are expected to sort by `seq`, not byte position.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::sink::LineSink;

/// Version stamp written in the stream header.
pub(crate) const FORMAT_VERSION: u32 = 1;

// Identity of the calling thread; callable from threads in any state of
// setup or teardown.
fn thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

pub(crate) struct Recorder {
    // Live address -> size, sharded by address hash to keep the hot path off
    // a single global lock.
    live: DashMap<usize, usize>,
    seq: AtomicU64,
    // Free/realloc calls that referenced an address with no live allocation,
    // plus allocations reported over a still-live address.
    anomalies: AtomicU64,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Recorder {
            live: DashMap::new(),
            seq: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn note_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    pub(crate) fn write_header(&self, sink: &LineSink) {
        sink.submit(format!("h {:x} {:x}\n", FORMAT_VERSION, process::id()));
    }

    /// Record an allocation of `size` bytes at `addr`.  `sink` is `None` while
    /// the tracker is paused: the table stays current, nothing is emitted.
    pub(crate) fn on_malloc(&self, addr: usize, size: usize, sink: Option<&LineSink>) {
        if addr == 0 {
            return;
        }
        if self.live.insert(addr, size).is_some() {
            self.note_anomaly();
        }
        if let Some(sink) = sink {
            sink.submit(format!(
                "+ {:x} {:x} {:x} {:x}\n",
                self.next_seq(),
                thread_id(),
                addr,
                size
            ));
        }
    }

    /// Record a deallocation.  Free of null is a no-op, mirroring `free`.
    pub(crate) fn on_free(&self, addr: usize, sink: Option<&LineSink>) {
        if addr == 0 {
            return;
        }
        let size = match self.live.remove(&addr) {
            Some((_, size)) => size,
            None => {
                self.note_anomaly();
                0
            }
        };
        if let Some(sink) = sink {
            sink.submit(format!(
                "- {:x} {:x} {:x} {:x}\n",
                self.next_seq(),
                thread_id(),
                addr,
                size
            ));
        }
    }

    /// Record a reallocation from `old` to `new`.  Degenerate shapes are
    /// normalized before anything is written:
    ///
    /// - `old == null` is an allocation of `new`;
    /// - `new == null` with `size == 0` is a free of `old`;
    /// - `new == null` with a nonzero size is a failed grow and left alone;
    /// - `old == new` updates the table entry in place and emits one
    ///   reallocation record, never a free/malloc pair.
    pub(crate) fn on_realloc(&self, old: usize, size: usize, new: usize, sink: Option<&LineSink>) {
        if new == 0 {
            if size == 0 && old != 0 {
                self.on_free(old, sink);
            }
            return;
        }
        if old == 0 {
            self.on_malloc(new, size, sink);
            return;
        }
        let prior = if old == new {
            self.live.insert(new, size)
        } else {
            let prior = self.live.remove(&old).map(|(_, size)| size);
            self.live.insert(new, size);
            prior
        };
        let old_size = match prior {
            Some(old_size) => old_size,
            None => {
                self.note_anomaly();
                0
            }
        };
        if let Some(sink) = sink {
            sink.submit(format!(
                "~ {:x} {:x} {:x} {:x} {:x} {:x}\n",
                self.next_seq(),
                thread_id(),
                old,
                old_size,
                new,
                size
            ));
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_size(&self, addr: usize) -> Option<usize> {
        self.live.get(&addr).map(|entry| *entry.value())
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.live.len()
    }
}
