//! Dynamic-library loading and symbol lookup, passed through to the platform
//! loader.

use libloading::{Library, Symbol};
use std::ffi::{c_void, CString};
use std::fmt;
use std::path::Path;

use crate::error::FfiError;

/// A loaded native library.
pub struct NativeLibrary {
    /// The underlying library handle; closed on drop.
    library: Library,
    /// Path to the library (for diagnostics).
    path: String,
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl NativeLibrary {
    /// Load a native library from a path.
    ///
    /// On Windows, looks for `.dll` files.
    /// On macOS, looks for `.dylib` files.
    /// On Linux, looks for `.so` files.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FfiError> {
        let path = path.as_ref();

        let library = unsafe { Library::new(path) }.map_err(|e| {
            FfiError::Library(format!(
                "Failed to load library '{}': {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self {
            library,
            path: path.display().to_string(),
        })
    }

    /// Load a library by name, searching standard paths.
    ///
    /// The name should be the base name without extension (e.g., "mylib").
    pub fn load_by_name(name: &str) -> Result<Self, FfiError> {
        let lib_name = Self::platform_lib_name(name);

        // Try loading from current directory first
        if let Ok(lib) = Self::load(&lib_name) {
            return Ok(lib);
        }

        // Try loading from system paths
        let library = unsafe { Library::new(&lib_name) }.map_err(|e| {
            FfiError::Library(format!(
                "Failed to load library '{}' (tried '{}'): {}",
                name, lib_name, e
            ))
        })?;

        Ok(Self {
            library,
            path: lib_name,
        })
    }

    /// Load a library with raw `RTLD_*` flags (unix only); the flags pass
    /// through to the loader unmodified.
    #[cfg(unix)]
    pub fn load_with_flags(
        path: impl AsRef<Path>,
        flags: std::os::raw::c_int,
    ) -> Result<Self, FfiError> {
        let path = path.as_ref();
        let library = unsafe {
            libloading::os::unix::Library::open(Some(path), flags)
        }
        .map_err(|e| {
            FfiError::Library(format!(
                "Failed to load library '{}': {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self {
            library: library.into(),
            path: path.display().to_string(),
        })
    }

    /// Get the platform-specific library filename.
    fn platform_lib_name(name: &str) -> String {
        #[cfg(target_os = "windows")]
        {
            format!("{}.dll", name)
        }
        #[cfg(target_os = "macos")]
        {
            format!("lib{}.dylib", name)
        }
        #[cfg(target_os = "linux")]
        {
            format!("lib{}.so", name)
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            format!("lib{}.so", name)
        }
    }

    /// Get a function pointer from the library.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - The function exists in the library
    /// - The type `F` matches the actual function signature
    pub unsafe fn get_function<F>(&self, name: &str) -> Result<Symbol<'_, F>, FfiError> {
        let c_name = CString::new(name)
            .map_err(|_| FfiError::Library(format!("Invalid function name: {}", name)))?;

        // SAFETY: forwarded to the caller's contract above.
        unsafe { self.library.get(c_name.as_bytes_with_nul()) }.map_err(|e| {
            FfiError::Library(format!(
                "Function '{}' not found in '{}': {}",
                name, self.path, e
            ))
        })
    }

    /// Resolve a symbol to its raw address, for passthrough to the
    /// call-interface layer.
    ///
    /// # Safety
    ///
    /// The returned address is only valid while this library stays loaded.
    pub unsafe fn symbol_address(&self, name: &str) -> Result<*const c_void, FfiError> {
        // SAFETY: looking a symbol up as a raw pointer makes no type claim.
        let symbol: Symbol<'_, *const c_void> = unsafe { self.get_function(name) }?;
        Ok(*symbol)
    }

    /// Get the path of this library.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// The calling thread's last OS error number (the C `errno` value).
pub fn thread_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Raw `dlopen` flag values, re-exported for the managed surface (unix only).
#[cfg(unix)]
pub mod dlopen_flags {
    pub use libloading::os::unix::{RTLD_GLOBAL, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};
}
