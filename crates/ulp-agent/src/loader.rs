//! Thin wrapper over the platform dynamic loader (`dlopen`/`dlsym`/
//! `dl_iterate_phdr`), used in-process where the real loader is already
//! available to us (spec §4.3: "open the livepatch shared object and the
//! target shared object via the platform dynamic loader").

use std::ffi::{c_void, CString};
use std::os::raw::c_char;

use crate::error::AgentError;

struct FindByName<'a> {
    name: &'a str,
    base: Option<u64>,
}

unsafe extern "C" fn iter_phdr_cb(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> i32 {
    let ctx = &mut *(data as *mut FindByName);
    let name_ptr = (*info).dlpi_name;
    if !name_ptr.is_null() {
        let name = std::ffi::CStr::from_ptr(name_ptr).to_string_lossy();
        if name == ctx.name || name.ends_with(ctx.name.rsplit('/').next().unwrap_or(ctx.name)) {
            ctx.base = Some((*info).dlpi_addr);
            return 1;
        }
    }
    0
}

/// Finds the load (bias) address of an already-mapped object by its
/// absolute path or trailing filename (spec §4.2's link-map walk, reused
/// here in-process via `dl_iterate_phdr` rather than a remote link-map
/// read).
pub fn find_loaded_object(name: &str) -> Option<u64> {
    let mut ctx = FindByName { name, base: None };
    unsafe {
        libc::dl_iterate_phdr(Some(iter_phdr_cb), &mut ctx as *mut _ as *mut c_void);
    }
    ctx.base
}

fn cstring(s: &str) -> Result<CString, AgentError> {
    CString::new(s).map_err(|_| AgentError::LoadFailed(s.to_string()))
}

/// Loads a shared object with `RTLD_NOW`, as the livepatch `.so` is
/// (spec §4.3).
pub fn dlopen_now(path: &str) -> Result<*mut c_void, AgentError> {
    let c_path = cstring(path)?;
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
    if handle.is_null() {
        Err(AgentError::LoadFailed(path.to_string()))
    } else {
        Ok(handle)
    }
}

/// Obtains a handle to an object already loaded in this process, without
/// loading a second copy (`RTLD_NOLOAD`).
pub fn dlopen_noload(path: &str) -> Result<*mut c_void, AgentError> {
    let c_path = cstring(path)?;
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
    if handle.is_null() {
        Err(AgentError::LoadFailed(path.to_string()))
    } else {
        Ok(handle)
    }
}

/// Resolves a symbol's runtime address through a loader handle.
///
/// # Safety
/// `handle` must be a valid handle returned by [`dlopen_now`] or
/// [`dlopen_noload`] that has not since been closed.
pub unsafe fn dlsym_addr(handle: *mut c_void, symbol: &str) -> Result<u64, AgentError> {
    let c_sym = cstring(symbol)?;
    let addr = unsafe { libc::dlsym(handle, c_sym.as_ptr() as *const c_char) };
    if addr.is_null() {
        Err(AgentError::SymbolMissing(symbol.to_string()))
    } else {
        Ok(addr as u64)
    }
}
