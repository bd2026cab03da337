//! Cross-thread dispatch primitives.
//!
//! A foreign thread that invokes a closure trampoline hands the invocation to
//! the runtime thread as a [`PendingInvocation`] and blocks on its single-shot
//! [`Rendezvous`] until the runtime thread has executed the callback and
//! filled the caller's buffers in place. Asynchronous native-call completions
//! travel through the same queue as [`DispatchTask::Completion`] entries so
//! the runtime thread observes all cross-thread work in one drain loop.

use std::ffi::c_void;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::callback::ClosureRecord;
use crate::worker::AsyncCallContext;

/// A single-shot blocking handoff between two threads.
///
/// `wait` must be called by the thread that created the rendezvous; `signal`
/// may be called exactly once from any thread. Waiting after the signal has
/// fired returns immediately.
pub(crate) struct Rendezvous {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Rendezvous {
    pub(crate) fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until [`Rendezvous::signal`] has been called.
    pub(crate) fn wait(&self) {
        let mut done = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .cond
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Release the waiting thread.
    pub(crate) fn signal(&self) {
        let mut done = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cond.notify_one();
    }
}

/// One in-flight cross-thread closure invocation.
///
/// The result and argument buffers are shared by address; the invoking
/// foreign thread owns them and stays blocked until the runtime thread has
/// written results into them, so the addresses remain valid for the whole
/// time the queue references this record.
pub(crate) struct PendingInvocation {
    pub(crate) record: Arc<ClosureRecord>,
    pub(crate) result: *mut c_void,
    pub(crate) args: *mut *mut c_void,
    pub(crate) rendezvous: Rendezvous,
}

// SAFETY: the raw buffer pointers are only dereferenced on the runtime thread
// while the foreign owner is blocked on the rendezvous.
unsafe impl Send for PendingInvocation {}
unsafe impl Sync for PendingInvocation {}

impl PendingInvocation {
    pub(crate) fn new(
        record: Arc<ClosureRecord>,
        result: *mut c_void,
        args: *mut *mut c_void,
    ) -> Self {
        Self {
            record,
            result,
            args,
            rendezvous: Rendezvous::new(),
        }
    }
}

/// Work item observed by the runtime thread's drain loop, in FIFO order.
pub(crate) enum DispatchTask {
    /// A foreign-thread closure invocation waiting on its rendezvous.
    Callback(Arc<PendingInvocation>),
    /// A finished asynchronous native call whose completion callback must run
    /// on the runtime thread.
    Completion(AsyncCallContext),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_rendezvous_releases_waiter() {
        let rv = Arc::new(Rendezvous::new());
        let signaler = Arc::clone(&rv);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.signal();
        });
        rv.wait();
        t.join().unwrap();
    }

    #[test]
    fn test_rendezvous_wait_after_signal_returns_immediately() {
        let rv = Rendezvous::new();
        rv.signal();
        rv.wait();
    }
}
