//! Per-thread reentrancy state machine.
//!
//! Every record hook the tracker exposes can be reached recursively: the
//! tracker's own bookkeeping and serialization allocate, and those allocations
//! are routed back into the very same hooks by whatever interception mechanism
//! the host uses.  Each thread is therefore either `Idle` or `Recording`, and
//! a hook that finds its thread already `Recording` must pass the nested call
//! through without recording it.  This is a correctness requirement, not an
//! optimization: without it the tracker recurses without bound and reports its
//! own memory use.

use std::cell::Cell;

thread_local! {
    // Flag used to detect nested calls into the tracker on this thread.
    static RECORDING: Cell<bool> = Cell::new(false);
}

/// Token proving the calling thread moved from `Idle` to `Recording`.
/// Dropping it moves the thread back to `Idle`.
pub(crate) struct ReentryGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

/// Try to move the calling thread from `Idle` to `Recording`.
///
/// Returns `None` if the thread is already `Recording`, or if its thread-local
/// storage is not usable (a thread that is still starting up or already being
/// torn down).  Callers treat `None` as "do not record".
pub(crate) fn enter() -> Option<ReentryGuard> {
    let entered = RECORDING.try_with(|flag| {
        if flag.get() {
            false
        } else {
            flag.set(true);
            true
        }
    });
    match entered {
        Ok(true) => Some(ReentryGuard {
            _not_send: std::marker::PhantomData,
        }),
        // Nested call, or TLS unavailable during thread setup/teardown.
        _ => None,
    }
}

/// Permanently mark the calling thread as internal to the tracker.
///
/// Used by the sink's flusher thread: lines it drains were allocated on
/// recording threads, so dropping them here must never surface as host events.
pub(crate) fn exclude_current_thread() {
    let _ = RECORDING.try_with(|flag| flag.set(true));
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        // Ignore errors accessing the TLS when the thread is being destroyed.
        let _ = RECORDING.try_with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_enter_is_refused() {
        let outer = enter();
        assert!(outer.is_some());
        // Depth on the recording path never exceeds one.
        assert!(enter().is_none());
        assert!(enter().is_none());
        drop(outer);
        let again = enter();
        assert!(again.is_some());
    }

    #[test]
    fn guard_is_per_thread() {
        let _outer = enter().unwrap();
        std::thread::spawn(|| {
            assert!(enter().is_some());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn excluded_thread_never_enters() {
        std::thread::spawn(|| {
            exclude_current_thread();
            assert!(enter().is_none());
            assert!(enter().is_none());
        })
        .join()
        .unwrap();
    }
}
