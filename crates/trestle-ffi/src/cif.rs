//! Call-interface (cif) preparation.
//!
//! A [`CallInterface`] is a prepared description of one native signature:
//! return type, ordered argument types, and ABI. It is built once and reused
//! across any number of calls to functions with that signature. The descriptor
//! owns its storage (the cif record and the argument-type array it points
//! into), so it stays valid for as long as the value is alive and can be
//! shared freely behind an `Arc`.

use std::fmt;
use std::mem;

use libffi::raw;

use crate::error::FfiError;
use crate::types::NativeType;

/// Calling-convention tag accepted by the preparation entry points.
pub type Abi = raw::ffi_abi;

/// The platform's default calling convention.
pub const DEFAULT_ABI: Abi = raw::ffi_abi_FFI_DEFAULT_ABI;

/// A prepared, reusable call descriptor for one native function signature.
pub struct CallInterface {
    cif: Box<raw::ffi_cif>,
    // The cif records a pointer into this array; it must not move or drop
    // before the cif does.
    _arg_types: Box<[*mut raw::ffi_type]>,
    arg_count: usize,
    fixed_arg_count: usize,
    variadic: bool,
}

impl fmt::Debug for CallInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInterface")
            .field("arg_count", &self.arg_count)
            .field("fixed_arg_count", &self.fixed_arg_count)
            .field("variadic", &self.variadic)
            .finish_non_exhaustive()
    }
}

// The descriptor is write-once at preparation and read-only afterwards; the
// raw pointers refer to process-lifetime ffi_type data or to storage owned by
// this value.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    /// Prepare a fixed-arity call interface from primitive type tags.
    pub fn prepare_fixed(
        ret: NativeType,
        args: &[NativeType],
        abi: Abi,
    ) -> Result<Self, FfiError> {
        let arg_types: Vec<*mut raw::ffi_type> =
            args.iter().map(|t| t.ffi_type()).collect();
        // SAFETY: the handles come from the static primitive type table.
        unsafe { Self::prepare_fixed_raw(ret.ffi_type(), arg_types, abi) }
    }

    /// Prepare a variadic call interface from primitive type tags.
    ///
    /// `args` lists every argument of the concrete call; the first
    /// `fixed_arg_count` of them belong to the function's fixed signature.
    pub fn prepare_variadic(
        ret: NativeType,
        args: &[NativeType],
        fixed_arg_count: usize,
        abi: Abi,
    ) -> Result<Self, FfiError> {
        let arg_types: Vec<*mut raw::ffi_type> =
            args.iter().map(|t| t.ffi_type()).collect();
        // SAFETY: the handles come from the static primitive type table.
        unsafe { Self::prepare_variadic_raw(ret.ffi_type(), arg_types, fixed_arg_count, abi) }
    }

    /// Prepare a fixed-arity call interface from opaque type handles.
    ///
    /// This is the passthrough entry point for collaborators that build their
    /// own type trees (struct layouts and the like).
    ///
    /// # Safety
    ///
    /// Every handle in `arg_types` and `ret` must point to a valid `ffi_type`
    /// that outlives the returned descriptor.
    pub unsafe fn prepare_fixed_raw(
        ret: *mut raw::ffi_type,
        arg_types: Vec<*mut raw::ffi_type>,
        abi: Abi,
    ) -> Result<Self, FfiError> {
        let count = arg_types.len();
        unsafe { Self::prep(ret, arg_types, count, false, abi) }
    }

    /// Variadic counterpart of [`CallInterface::prepare_fixed_raw`].
    ///
    /// # Safety
    ///
    /// Same contract as [`CallInterface::prepare_fixed_raw`].
    pub unsafe fn prepare_variadic_raw(
        ret: *mut raw::ffi_type,
        arg_types: Vec<*mut raw::ffi_type>,
        fixed_arg_count: usize,
        abi: Abi,
    ) -> Result<Self, FfiError> {
        if fixed_arg_count > arg_types.len() {
            return Err(FfiError::InvalidArgument(format!(
                "variadic preparation: {} fixed arguments exceed {} total",
                fixed_arg_count,
                arg_types.len()
            )));
        }
        unsafe { Self::prep(ret, arg_types, fixed_arg_count, true, abi) }
    }

    unsafe fn prep(
        ret: *mut raw::ffi_type,
        arg_types: Vec<*mut raw::ffi_type>,
        fixed_arg_count: usize,
        variadic: bool,
        abi: Abi,
    ) -> Result<Self, FfiError> {
        if ret.is_null() {
            return Err(FfiError::InvalidArgument(
                "return type handle is null".into(),
            ));
        }
        if arg_types.iter().any(|t| t.is_null()) {
            return Err(FfiError::InvalidArgument(
                "argument type handle is null".into(),
            ));
        }

        let arg_count = arg_types.len();
        let mut arg_types = arg_types.into_boxed_slice();
        // SAFETY: ffi_cif is a plain C record; preparation below fills it in.
        let mut cif: Box<raw::ffi_cif> = Box::new(unsafe { mem::zeroed() });

        // A variadic signature must go through the variadic preparation even
        // when the concrete call carries no extra arguments; some ABIs use a
        // distinct calling convention for variadic functions.
        let status = unsafe {
            if variadic {
                raw::ffi_prep_cif_var(
                    &mut *cif,
                    abi,
                    fixed_arg_count as u32,
                    arg_count as u32,
                    ret,
                    arg_types.as_mut_ptr(),
                )
            } else {
                raw::ffi_prep_cif(
                    &mut *cif,
                    abi,
                    arg_count as u32,
                    ret,
                    arg_types.as_mut_ptr(),
                )
            }
        };

        map_status(status)?;
        Ok(Self {
            cif,
            _arg_types: arg_types,
            arg_count,
            fixed_arg_count,
            variadic,
        })
    }

    /// Number of arguments in the described signature.
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    /// Whether the signature was prepared as variadic.
    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    pub(crate) fn cif_ptr(&self) -> *mut raw::ffi_cif {
        // The underlying call entry points take a mutable cif pointer but do
        // not mutate a prepared record.
        &*self.cif as *const raw::ffi_cif as *mut raw::ffi_cif
    }
}

#[allow(non_upper_case_globals)]
fn map_status(status: raw::ffi_status) -> Result<(), FfiError> {
    match status {
        raw::ffi_status_FFI_OK => Ok(()),
        raw::ffi_status_FFI_BAD_TYPEDEF => Err(FfiError::BadTypedef {
            status: status as u32,
        }),
        raw::ffi_status_FFI_BAD_ABI => Err(FfiError::BadAbi {
            status: status as u32,
        }),
        other => Err(FfiError::PrepFailed {
            status: other as u32,
        }),
    }
}
