//! Closure (trampoline) subsystem.
//!
//! [`ClosureHandle::create`] turns a host callback into a real native
//! function pointer. Invoking that pointer lands in [`closure_trampoline`],
//! which resolves its tagged key back to the [`ClosureRecord`] and either
//! dispatches on the spot (runtime thread) or parks the calling foreign
//! thread on a rendezvous until the runtime thread drains the invocation.
//!
//! Closure lifetime is bound to host-side garbage collection: dropping the
//! handle is the finalizer, and it is the only path that releases the
//! trampoline allocation. There is no explicit free API.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use libffi::raw;
use once_cell::sync::Lazy;

use crate::cif::CallInterface;
use crate::error::FfiError;
use crate::queue::{DispatchTask, PendingInvocation};
use crate::runtime::{RuntimeHandle, RuntimeState};
use crate::worker::panic_text;

/// Host callback bound to a closure. Receives a view over the result buffer
/// (length = configured result size) and a view over the argument-pointer
/// array (length = configured argument count); writes its return value into
/// the result view in place. A returned `Some(message)` is an
/// application-level error. Only ever invoked on the runtime thread.
pub type CallbackFn = Box<dyn Fn(&mut [u8], &[*const c_void]) -> Option<String>>;

/// Error-report callback bound to a closure. Receives errors raised by a
/// queued (foreign-thread) dispatch, where raising into the invoking native
/// stack is impossible. Only ever invoked on the runtime thread.
pub type ErrorReportFn = Box<dyn Fn(&str)>;

/// Tagged context handle stored with the trampoline; resolved back to a
/// [`ClosureRecord`] through the closure table on every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ClosureKey(u64);

impl fmt::Display for ClosureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One host-function-to-native-pointer binding.
///
/// Every field is written once at creation and read-only afterwards; the
/// destructor is the only other writer, and shared ownership guarantees it
/// runs after the last in-flight invocation has finished with the record.
pub(crate) struct ClosureRecord {
    /// Writable side of the closure allocation.
    closure: *mut c_void,
    /// Executable code address foreign code calls.
    code: *const c_void,
    callback: CallbackFn,
    error_report: ErrorReportFn,
    result_size: usize,
    arg_count: usize,
    pub(crate) runtime: Arc<RuntimeState>,
    // Keeps the type storage the trampoline's cif points into alive.
    _cif: Arc<CallInterface>,
    key: ClosureKey,
}

// SAFETY: the record crosses threads inside queue entries, but `callback` and
// `error_report` are only invoked on the runtime thread, and all other fields
// are immutable after creation.
unsafe impl Send for ClosureRecord {}
unsafe impl Sync for ClosureRecord {}

impl Drop for ClosureRecord {
    fn drop(&mut self) {
        // SAFETY: `closure` came from ffi_closure_alloc and the table entry
        // is already gone, so nothing can resolve to this record anymore.
        unsafe { raw::ffi_closure_free(self.closure) };
        log::debug!("closure {} released", self.key);
    }
}

struct ClosureTable {
    entries: Mutex<HashMap<u64, Arc<ClosureRecord>>>,
    next_key: AtomicU64,
}

impl ClosureTable {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        }
    }

    fn allocate_key(&self) -> ClosureKey {
        ClosureKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, record: Arc<ClosureRecord>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.key.0, record);
    }

    fn remove(&self, key: ClosureKey) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key.0);
    }

    fn resolve(&self, key: ClosureKey) -> Option<Arc<ClosureRecord>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.0)
            .cloned()
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

static TABLE: Lazy<ClosureTable> = Lazy::new(ClosureTable::new);

/// Number of live closure records in the process. Diagnostic.
pub fn live_closure_count() -> usize {
    TABLE.len()
}

thread_local! {
    static PENDING_CALLBACK_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Take the error a same-thread closure dispatch raised, if any.
///
/// A direct (runtime-thread) dispatch cannot unwind through the foreign
/// frames between the managed caller and the trampoline, so the error is
/// parked here; the managed surface collects it once the outer native call
/// returns, the way a pending-exception slot works.
pub fn take_pending_callback_error() -> Option<String> {
    PENDING_CALLBACK_ERROR.with(|slot| slot.borrow_mut().take())
}

fn set_pending_callback_error(message: String) {
    PENDING_CALLBACK_ERROR.with(|slot| {
        if let Some(previous) = slot.borrow_mut().replace(message) {
            log::warn!("undelivered callback error overwritten: {previous}");
        }
    });
}

/// Owning handle for one closure; exposes the native code address.
///
/// Dropping the handle is the host GC finalizer: it runs the record's
/// destructor (releasing the bound callbacks) and frees the trampoline
/// allocation, after any in-flight invocation has completed. The code address
/// is valid exactly while the handle is alive; calling it afterwards is
/// undefined behavior.
pub struct ClosureHandle {
    record: Arc<ClosureRecord>,
}

impl fmt::Debug for ClosureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureHandle")
            .field("key", &self.record.key)
            .field("code", &self.record.code)
            .finish_non_exhaustive()
    }
}

impl ClosureHandle {
    /// Allocate a closure and bind `callback`/`error_report` to it.
    ///
    /// `result_size` is the byte length of the result view handed to the
    /// callback; `arg_count` must match the descriptor's argument count.
    pub fn create(
        runtime: &RuntimeHandle,
        cif: Arc<CallInterface>,
        result_size: usize,
        arg_count: usize,
        error_report: ErrorReportFn,
        callback: CallbackFn,
    ) -> Result<Self, FfiError> {
        if arg_count != cif.arg_count() {
            return Err(FfiError::InvalidArgument(format!(
                "closure argument count {arg_count} does not match descriptor ({})",
                cif.arg_count()
            )));
        }

        let mut code: *mut c_void = ptr::null_mut();
        // SAFETY: plain allocation call; checked for null below.
        let closure = unsafe {
            raw::ffi_closure_alloc(mem::size_of::<raw::ffi_closure>(), &mut code)
        };
        if closure.is_null() {
            return Err(FfiError::ClosureAllocation);
        }

        let record = Arc::new(ClosureRecord {
            closure,
            code,
            callback,
            error_report,
            result_size,
            arg_count,
            runtime: Arc::clone(runtime.state()),
            _cif: Arc::clone(&cif),
            key: TABLE.allocate_key(),
        });
        TABLE.insert(Arc::clone(&record));

        // SAFETY: `closure` and `code` come from the allocation above; the
        // userdata pointer targets the key field inside the Arc'd record,
        // which outlives the trampoline registration.
        let status = unsafe {
            raw::ffi_prep_closure_loc(
                closure as *mut raw::ffi_closure,
                cif.cif_ptr(),
                Some(closure_trampoline),
                &record.key as *const ClosureKey as *mut c_void,
                code,
            )
        };
        if status != raw::ffi_status_FFI_OK {
            TABLE.remove(record.key);
            // Dropping the record frees the closure allocation.
            return Err(FfiError::ClosurePreparation {
                status: status as u32,
            });
        }

        log::debug!(
            "closure {} created for runtime instance {}",
            record.key,
            record.runtime.id()
        );
        Ok(Self { record })
    }

    /// The executable native function pointer bound to the host callback.
    pub fn code_ptr(&self) -> *const c_void {
        self.record.code
    }
}

impl Drop for ClosureHandle {
    fn drop(&mut self) {
        TABLE.remove(self.record.key);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DispatchOrigin {
    /// Invoked on the runtime thread; errors go to the pending slot.
    Direct,
    /// Drained from the queue for a blocked foreign thread; errors go to the
    /// bound error-report callback.
    Queued,
}

/// Execute the host callback for one invocation. Runtime thread only.
fn dispatch(
    record: &ClosureRecord,
    result: *mut c_void,
    args: *mut *mut c_void,
    origin: DispatchOrigin,
) {
    let result_view: &mut [u8] = if record.result_size == 0 || result.is_null() {
        &mut []
    } else {
        // SAFETY: the invoking native caller supplied a result buffer of the
        // configured size; for a queued dispatch the owner stays blocked on
        // the rendezvous while we write it.
        unsafe { slice::from_raw_parts_mut(result as *mut u8, record.result_size) }
    };
    let args_view: &[*const c_void] = if record.arg_count == 0 || args.is_null() {
        &[]
    } else {
        // SAFETY: the caller supplied one pointer per declared argument.
        unsafe { slice::from_raw_parts(args as *const *const c_void, record.arg_count) }
    };

    // Never let a host panic unwind into foreign frames.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        (record.callback)(result_view, args_view)
    }));
    match outcome {
        Ok(None) => {}
        Ok(Some(message)) => report(record, origin, message),
        Err(payload) => report(record, origin, panic_text(payload)),
    }
}

fn report(record: &ClosureRecord, origin: DispatchOrigin, message: String) {
    match origin {
        DispatchOrigin::Queued => (record.error_report)(&message),
        DispatchOrigin::Direct => set_pending_callback_error(message),
    }
}

/// Drain-loop entry for a queued invocation.
pub(crate) fn dispatch_queued(inv: &PendingInvocation) {
    dispatch(&inv.record, inv.result, inv.args, DispatchOrigin::Queued);
}

/// Target of every closure trampoline.
///
/// Foreign code may call in from any thread it likes; managed code only ever
/// runs on the runtime thread, so a foreign-thread invocation is queued and
/// the caller blocked until the runtime thread has filled the result buffer
/// in place. The call is observably synchronous either way.
unsafe extern "C" fn closure_trampoline(
    _cif: *mut raw::ffi_cif,
    result: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    // SAFETY: prep_closure_loc registered a pointer to the record's key.
    let key = unsafe { *(userdata as *const ClosureKey) };
    let Some(record) = TABLE.resolve(key) else {
        // A live trampoline always has a table entry; hitting this means the
        // host finalized the closure while foreign code still held the
        // pointer, which is already undefined behavior. Fail loudly.
        log::error!("closure {key} invoked after finalization");
        return;
    };

    if record.runtime.is_runtime_thread() {
        dispatch(&record, result, args, DispatchOrigin::Direct);
        return;
    }

    let inv = Arc::new(PendingInvocation::new(Arc::clone(&record), result, args));
    match record
        .runtime
        .enqueue(DispatchTask::Callback(Arc::clone(&inv)))
    {
        Ok(()) => inv.rendezvous.wait(),
        Err(err) => {
            // Teardown already began: fail fast with a zeroed result instead
            // of leaving this thread blocked forever.
            log::error!("closure {key} invocation rejected: {err}");
            if !result.is_null() && record.result_size > 0 {
                // SAFETY: caller-supplied result buffer of the configured
                // size.
                unsafe {
                    ptr::write_bytes(result as *mut u8, 0, record.result_size)
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cif::DEFAULT_ABI;
    use crate::types::NativeType;

    #[test]
    fn test_create_rejects_mismatched_arg_count() {
        let runtime = RuntimeHandle::register(Box::new(|| {}));
        let cif = Arc::new(
            CallInterface::prepare_fixed(
                NativeType::I32,
                &[NativeType::I32],
                DEFAULT_ABI,
            )
            .unwrap(),
        );
        let err = ClosureHandle::create(
            &runtime,
            cif,
            NativeType::I32.result_size(),
            3,
            Box::new(|_| {}),
            Box::new(|_, _| None),
        )
        .unwrap_err();
        assert!(matches!(err, FfiError::InvalidArgument(_)));
        runtime.teardown().unwrap();
    }

    #[test]
    fn test_pending_error_slot_is_take_once() {
        assert!(take_pending_callback_error().is_none());
        set_pending_callback_error("first".into());
        assert_eq!(take_pending_callback_error().as_deref(), Some("first"));
        assert!(take_pending_callback_error().is_none());
    }
}
