//! Best-effort diagnostic side channel.
//!
//! Internal anomalies (a sink that cannot be opened, dropped lines, a second
//! `init` attempt) are reported here instead of through the event stream, and
//! never as errors that could propagate into the host's control flow.  The
//! host registers at most one callback; when none is registered, diagnostics
//! are dropped.

use std::fmt;

use parking_lot::RwLock;

use crate::reentry;

/// Callback invoked with one formatted diagnostic per detected anomaly.
///
/// The diagnostic is handed over as [`fmt::Arguments`], so the channel itself
/// performs no allocation; the callback decides whether to render it to
/// stderr, a log file, or nowhere.  Anything the callback allocates while
/// running is invisible to the tracker.
pub type WarningCallback = fn(fmt::Arguments<'_>);

pub(crate) struct WarningChannel {
    callback: RwLock<Option<WarningCallback>>,
}

impl WarningChannel {
    pub(crate) fn new() -> Self {
        WarningChannel {
            callback: RwLock::new(None),
        }
    }

    /// Replace the registered callback.  `None` silences the channel.
    pub(crate) fn set(&self, callback: Option<WarningCallback>) {
        *self.callback.write() = callback;
    }

    /// Deliver one diagnostic to the registered callback, if any.
    pub(crate) fn emit(&self, args: fmt::Arguments<'_>) {
        let callback = match *self.callback.read() {
            Some(callback) => callback,
            None => return,
        };
        // The callback runs under the reentrancy guard: its own allocations
        // must not loop back into the recorder.  If the guard is already held
        // (warning raised from inside the recording path) or this is the
        // excluded flusher thread, the callback simply inherits that state.
        let _guard = reentry::enter();
        callback(args);
    }
}
