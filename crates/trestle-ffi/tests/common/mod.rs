//! Shared helpers for the integration tests.

use std::sync::{Arc, Condvar, Mutex};

use trestle_ffi::WakeFn;

/// Counts wake-handle signals and lets the test thread block until a given
/// number have arrived, standing in for a runtime's event loop.
pub struct WakeSignal {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl WakeSignal {
    pub fn new() -> (WakeFn, WakeSignal) {
        let inner = Arc::new((Mutex::new(0u64), Condvar::new()));
        let wake_inner = Arc::clone(&inner);
        let wake: WakeFn = Box::new(move || {
            let (count, cond) = &*wake_inner;
            *count.lock().unwrap() += 1;
            cond.notify_all();
        });
        (wake, WakeSignal { inner })
    }

    /// Block until at least `n` wake signals have been observed in total.
    pub fn wait_for(&self, n: u64) {
        let (count, cond) = &*self.inner;
        let mut observed = count.lock().unwrap();
        while *observed < n {
            observed = cond.wait(observed).unwrap();
        }
    }

    pub fn count(&self) -> u64 {
        *self.inner.0.lock().unwrap()
    }
}
