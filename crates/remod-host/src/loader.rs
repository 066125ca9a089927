//! Shared-object loading and module construction.
//!
//! `dlopen` with `RTLD_NOW | RTLD_LOCAL`: symbols resolve eagerly (a
//! missing symbol fails the load, not a later call) and stay private to
//! the handle, so two builds of the same module can coexist briefly
//! during a reload.
//!
//! The host keeps the [`SharedLibrary`] guard until after the module's
//! worker thread has been joined — unloading the object while any thread
//! can still enter its code is undefined behavior.

use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};

use remod_api::{CreateModuleFn, HostHandle, Module};
use tracing::{debug, error};

use crate::error::LoaderError;

/// RAII handle to a loaded shared object. `dlclose` on drop.
#[derive(Debug)]
pub struct SharedLibrary {
    handle: *mut c_void,
    path: PathBuf,
}

// dlopen handles are process-global; the handle itself is freely shareable.
unsafe impl Send for SharedLibrary {}
unsafe impl Sync for SharedLibrary {}

impl SharedLibrary {
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        let path_c = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
            LoaderError::Open {
                path: path.to_path_buf(),
                reason: "path contains a NUL byte".into(),
            }
        })?;

        let handle = unsafe { libc::dlopen(path_c.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(LoaderError::Open {
                path: path.to_path_buf(),
                reason: last_dl_error(),
            });
        }
        debug!(path = %path.display(), "opened shared object");
        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a symbol by name.
    ///
    /// # Safety
    ///
    /// The caller must transmute the returned pointer to the symbol's
    /// actual type; a mismatch is undefined behavior.
    pub unsafe fn symbol(&self, name: &str) -> Result<*mut c_void, LoaderError> {
        let name_c = CString::new(name).map_err(|_| LoaderError::Symbol {
            symbol: name.into(),
            reason: "symbol name contains a NUL byte".into(),
        })?;
        let sym = libc::dlsym(self.handle, name_c.as_ptr());
        if sym.is_null() {
            return Err(LoaderError::Symbol {
                symbol: name.into(),
                reason: last_dl_error(),
            });
        }
        Ok(sym)
    }
}

impl Drop for SharedLibrary {
    fn drop(&mut self) {
        let result = unsafe { libc::dlclose(self.handle) };
        if result != 0 {
            error!(
                path = %self.path.display(),
                reason = %last_dl_error(),
                "dlclose failed"
            );
        } else {
            debug!(path = %self.path.display(), "closed shared object");
        }
    }
}

fn last_dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dl error".into()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

/// Factory symbol for a module name.
pub fn factory_symbol(name: &str) -> String {
    format!("create_module_{name}")
}

/// Resolve and invoke `create_module_<name>`, reclaiming the boxed module.
pub fn construct_module(
    lib: &SharedLibrary,
    name: &str,
    handle: &HostHandle,
) -> Result<Box<dyn Module>, LoaderError> {
    let symbol = factory_symbol(name);
    let factory: CreateModuleFn =
        unsafe { std::mem::transmute(lib.symbol(&symbol)?) };

    let raw = unsafe { factory(handle as *const HostHandle) };
    if raw.is_null() {
        return Err(LoaderError::NullFactory { symbol });
    }
    // The factory returns Box::into_raw(Box::new(Box<dyn Module>)).
    Ok(unsafe { *Box::from_raw(raw as *mut Box<dyn Module>) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_symbol_format() {
        assert_eq!(factory_symbol("worldgen"), "create_module_worldgen");
    }

    #[test]
    fn open_missing_library_fails() {
        let err = SharedLibrary::open(Path::new("/nonexistent/libnothing.so")).unwrap_err();
        assert!(matches!(err, LoaderError::Open { .. }));
    }
}
