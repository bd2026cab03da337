//! Synchronous invocation of a prepared call interface.

use std::ffi::c_void;
use std::mem;

use libffi::raw;

use crate::cif::CallInterface;
use crate::error::FfiError;

/// Execute one native call on the current thread.
///
/// The return value is written into `result`; integer results narrower than
/// `ffi_arg` are widened into the slot, so `result` must cover
/// [`crate::types::NativeType::result_size`] bytes for the descriptor's
/// return type. The contract is execute exactly once, synchronously, with the
/// given addresses; a fault inside the invoked function is the caller's
/// contract violation and is not recoverable here.
///
/// # Safety
///
/// - `fun` must be the address of a native function whose true signature
///   matches `cif`.
/// - `result` must be valid for writes of the descriptor's result size (it is
///   ignored for void returns and may then be null).
/// - `args` must point to `cif.arg_count()` pointers, each referring to a
///   live argument value of the declared type.
pub unsafe fn call_sync(
    cif: &CallInterface,
    fun: *const c_void,
    result: *mut c_void,
    args: *mut *mut c_void,
) -> Result<(), FfiError> {
    if fun.is_null() {
        return Err(FfiError::InvalidArgument(
            "function address is null".into(),
        ));
    }
    if cif.arg_count() > 0 && args.is_null() {
        return Err(FfiError::InvalidArgument(
            "argument pointer array is null".into(),
        ));
    }

    // SAFETY: upheld by the caller per the function contract above.
    unsafe {
        let fun: unsafe extern "C" fn() = mem::transmute(fun);
        raw::ffi_call(cif.cif_ptr(), Some(fun), result, args);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cif::DEFAULT_ABI;
    use crate::types::NativeType;

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    #[test]
    fn test_call_sync_matches_direct_invocation() {
        let cif = CallInterface::prepare_fixed(
            NativeType::I32,
            &[NativeType::I32, NativeType::I32],
            DEFAULT_ABI,
        )
        .unwrap();

        let mut a: i32 = 40;
        let mut b: i32 = 2;
        let mut result: raw::ffi_arg = 0;
        let mut argv: [*mut c_void; 2] = [
            &mut a as *mut i32 as *mut c_void,
            &mut b as *mut i32 as *mut c_void,
        ];

        unsafe {
            call_sync(
                &cif,
                add as *const c_void,
                &mut result as *mut raw::ffi_arg as *mut c_void,
                argv.as_mut_ptr(),
            )
            .unwrap();
        }
        assert_eq!(result as i32, add(40, 2));
    }

    #[test]
    fn test_call_sync_rejects_null_function() {
        let cif =
            CallInterface::prepare_fixed(NativeType::Void, &[], DEFAULT_ABI).unwrap();
        let err = unsafe {
            call_sync(
                &cif,
                std::ptr::null(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        }
        .unwrap_err();
        assert!(matches!(err, FfiError::InvalidArgument(_)));
    }
}
