//! Native type tags and the capability table.
//!
//! The collaborator that builds argument-type handles works from these tags:
//! each tag maps to the backing `ffi_type`, its byte size, and its alignment.
//! Aggregate (struct) type trees are supplied by the collaborator as opaque
//! `*mut ffi_type` handles and pass through the raw preparation entry points
//! untouched.

use std::ffi::c_void;
use std::mem;
use std::ptr::addr_of_mut;

use libffi::raw;

/// Size in bytes of the widened return slot (`ffi_arg`) the underlying call
/// mechanism writes small integer results into.
pub const FFI_ARG_SIZE: usize = mem::size_of::<raw::ffi_arg>();

/// Size in bytes of a native pointer.
pub const POINTER_SIZE: usize = mem::size_of::<*const c_void>();

/// Primitive native types this engine can describe directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    Void,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Pointer,
}

impl NativeType {
    /// Parse a type tag from its surface-level name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "void" => Some(NativeType::Void),
            "uint8" | "uchar" => Some(NativeType::U8),
            "int8" | "char" | "schar" => Some(NativeType::I8),
            "uint16" | "ushort" => Some(NativeType::U16),
            "int16" | "short" => Some(NativeType::I16),
            "uint32" | "uint" => Some(NativeType::U32),
            "int32" | "int" => Some(NativeType::I32),
            "uint64" | "ulonglong" => Some(NativeType::U64),
            "int64" | "longlong" => Some(NativeType::I64),
            "float" | "f32" => Some(NativeType::F32),
            "double" | "f64" => Some(NativeType::F64),
            "pointer" | "ptr" => Some(NativeType::Pointer),
            _ => None,
        }
    }

    /// Surface-level name for this tag.
    pub fn name(&self) -> &'static str {
        match self {
            NativeType::Void => "void",
            NativeType::U8 => "uint8",
            NativeType::I8 => "int8",
            NativeType::U16 => "uint16",
            NativeType::I16 => "int16",
            NativeType::U32 => "uint32",
            NativeType::I32 => "int32",
            NativeType::U64 => "uint64",
            NativeType::I64 => "int64",
            NativeType::F32 => "float",
            NativeType::F64 => "double",
            NativeType::Pointer => "pointer",
        }
    }

    /// Size of a value of this type in bytes.
    pub fn size(&self) -> usize {
        match self {
            NativeType::Void => 0,
            NativeType::U8 | NativeType::I8 => 1,
            NativeType::U16 | NativeType::I16 => 2,
            NativeType::U32 | NativeType::I32 | NativeType::F32 => 4,
            NativeType::U64 | NativeType::I64 | NativeType::F64 => 8,
            NativeType::Pointer => POINTER_SIZE,
        }
    }

    /// Alignment of a value of this type in bytes.
    pub fn alignment(&self) -> usize {
        match self {
            NativeType::Void => 1,
            NativeType::U8 | NativeType::I8 => mem::align_of::<u8>(),
            NativeType::U16 | NativeType::I16 => mem::align_of::<u16>(),
            NativeType::U32 | NativeType::I32 => mem::align_of::<u32>(),
            NativeType::U64 | NativeType::I64 => mem::align_of::<u64>(),
            NativeType::F32 => mem::align_of::<f32>(),
            NativeType::F64 => mem::align_of::<f64>(),
            NativeType::Pointer => mem::align_of::<*const c_void>(),
        }
    }

    /// Size of the buffer needed to receive a return value of this type.
    ///
    /// Integer returns narrower than `ffi_arg` are widened by the call
    /// mechanism, so the result buffer must cover the full slot.
    pub fn result_size(&self) -> usize {
        match self {
            NativeType::Void => 0,
            NativeType::F32 | NativeType::F64 => self.size(),
            _ => self.size().max(FFI_ARG_SIZE),
        }
    }

    /// The backing `ffi_type` handle for this tag.
    ///
    /// The returned pointer refers to process-lifetime static data owned by
    /// the underlying call-interface library.
    pub fn ffi_type(&self) -> *mut raw::ffi_type {
        unsafe {
            match self {
                NativeType::Void => addr_of_mut!(raw::ffi_type_void),
                NativeType::U8 => addr_of_mut!(raw::ffi_type_uint8),
                NativeType::I8 => addr_of_mut!(raw::ffi_type_sint8),
                NativeType::U16 => addr_of_mut!(raw::ffi_type_uint16),
                NativeType::I16 => addr_of_mut!(raw::ffi_type_sint16),
                NativeType::U32 => addr_of_mut!(raw::ffi_type_uint32),
                NativeType::I32 => addr_of_mut!(raw::ffi_type_sint32),
                NativeType::U64 => addr_of_mut!(raw::ffi_type_uint64),
                NativeType::I64 => addr_of_mut!(raw::ffi_type_sint64),
                NativeType::F32 => addr_of_mut!(raw::ffi_type_float),
                NativeType::F64 => addr_of_mut!(raw::ffi_type_double),
                NativeType::Pointer => addr_of_mut!(raw::ffi_type_pointer),
            }
        }
    }
}

/// One row of the capability table handed to the managed-surface collaborator.
#[derive(Debug, Clone, Copy)]
pub struct TypeCapability {
    pub ty: NativeType,
    pub name: &'static str,
    pub size: usize,
    pub alignment: usize,
}

const ALL_TYPES: [NativeType; 12] = [
    NativeType::Void,
    NativeType::U8,
    NativeType::I8,
    NativeType::U16,
    NativeType::I16,
    NativeType::U32,
    NativeType::I32,
    NativeType::U64,
    NativeType::I64,
    NativeType::F32,
    NativeType::F64,
    NativeType::Pointer,
];

/// The capability table: every primitive tag with its size and alignment.
pub fn capability_table() -> Vec<TypeCapability> {
    ALL_TYPES
        .iter()
        .map(|&ty| TypeCapability {
            ty,
            name: ty.name(),
            size: ty.size(),
            alignment: ty.alignment(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_aliases() {
        assert_eq!(NativeType::from_str("double"), Some(NativeType::F64));
        assert_eq!(NativeType::from_str("f64"), Some(NativeType::F64));
        assert_eq!(NativeType::from_str("uchar"), Some(NativeType::U8));
        assert_eq!(NativeType::from_str("ptr"), Some(NativeType::Pointer));
        assert_eq!(NativeType::from_str("complex"), None);
    }

    #[test]
    fn test_sizes_match_layout() {
        assert_eq!(NativeType::I32.size(), 4);
        assert_eq!(NativeType::F64.size(), 8);
        assert_eq!(NativeType::Pointer.size(), mem::size_of::<usize>());
        assert_eq!(NativeType::Void.size(), 0);
    }

    #[test]
    fn test_result_size_widens_small_integers() {
        assert_eq!(NativeType::U8.result_size(), FFI_ARG_SIZE);
        assert_eq!(NativeType::I32.result_size(), FFI_ARG_SIZE);
        assert_eq!(NativeType::F32.result_size(), 4);
        assert_eq!(NativeType::Void.result_size(), 0);
    }

    #[test]
    fn test_capability_table_covers_every_tag() {
        let table = capability_table();
        assert_eq!(table.len(), ALL_TYPES.len());
        for row in &table {
            assert_eq!(row.size, row.ty.size());
            assert_eq!(row.name, row.ty.name());
        }
    }

    #[test]
    fn test_ffi_type_handles_are_distinct() {
        assert_ne!(NativeType::F64.ffi_type(), NativeType::F32.ffi_type());
        assert!(!NativeType::Void.ffi_type().is_null());
    }
}
