//! Call-site rewriter (spec §4.6, C6): overwrites a target function's NOP
//! pad with the dispatcher-call prologue, under the right page protection.

use std::ffi::c_void;
use std::fs::File;
use std::io::BufReader;

use procfs_core::process::{MMPermissions, MemoryMaps};
use procfs_core::FromRead;
use ulp_common::abi::{
    DISPATCHER_FIELD_OFFSET, INDEX_FIELD_OFFSET, PRE_NOPS_LEN, PROLOGUE_TEMPLATE, ULP_NOPS_LEN,
};

use crate::error::AgentError;

fn read_self_maps() -> Option<MemoryMaps> {
    let f = File::open("/proc/self/maps").ok()?;
    MemoryMaps::from_read(BufReader::new(f)).ok()
}

/// Open-question decision (SPEC_FULL §9): since the rewriter cannot
/// directly observe "pad shorter than ULP_NOPS_LEN", it instead bounds the
/// write against the `/proc/self/maps` mapping containing `prologue_addr`
/// and rejects the rewrite if the full write range isn't contained in one
/// executable mapping.
fn check_mapping_bounds(prologue_addr: u64) -> Result<(), AgentError> {
    let write_end = prologue_addr + ULP_NOPS_LEN as u64;
    let contains = read_self_maps().into_iter().flat_map(|m| m.0).any(|m| {
        m.perms.contains(MMPermissions::EXECUTE) && m.address.0 <= prologue_addr && write_end <= m.address.1
    });
    if contains {
        Ok(())
    } else {
        Err(AgentError::MemoryProtectionFailed {
            addr: prologue_addr,
            len: ULP_NOPS_LEN,
        })
    }
}

/// Snapshots the 14 bytes at `patched_addr` before any rewrite touches
/// them (spec §3 `AppliedUnit.overwritten_bytes`, §5 ordering guarantee:
/// "taken before the call-site rewrite").
///
/// # Safety
/// `patched_addr` must be a valid, readable code address (resolved via a
/// `.ulp` jump slot, spec §6.2).
pub unsafe fn snapshot_overwritten_bytes(patched_addr: u64) -> [u8; 14] {
    let mut bytes = [0u8; 14];
    std::ptr::copy_nonoverlapping(patched_addr as *const u8, bytes.as_mut_ptr(), 14);
    bytes
}

/// Rewrites the NOP pad preceding `patched_addr` into a dispatcher-call
/// prologue carrying `index` and pointing at `dispatcher_addr` (spec §4.6
/// steps 1-6).
///
/// # Safety
/// `patched_addr` must be the true address of a live-patchable function
/// (resolved through its `.ulp` jump slot), with a genuine `PRE_NOPS_LEN`
/// byte NOP pad immediately before it.
pub unsafe fn patch_call_site(
    patched_addr: u64,
    index: u32,
    dispatcher_addr: u64,
) -> Result<(), AgentError> {
    let prologue_addr = patched_addr - PRE_NOPS_LEN as u64;
    check_mapping_bounds(prologue_addr)?;

    let page_size = libc::sysconf(libc::_SC_PAGESIZE) as u64;
    let page_start = prologue_addr & !(page_size - 1);
    let span = (prologue_addr + ULP_NOPS_LEN as u64 - page_start) as usize;

    let set_prot = |prot: i32| -> Result<(), AgentError> {
        let rc = libc::mprotect(page_start as *mut c_void, span, prot);
        if rc == 0 {
            Ok(())
        } else {
            Err(AgentError::MemoryProtectionFailed {
                addr: page_start,
                len: span,
            })
        }
    };

    set_prot(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)?;

    let mut template = PROLOGUE_TEMPLATE;
    template[INDEX_FIELD_OFFSET..INDEX_FIELD_OFFSET + 4].copy_from_slice(&index.to_le_bytes());
    template[DISPATCHER_FIELD_OFFSET..DISPATCHER_FIELD_OFFSET + 8]
        .copy_from_slice(&dispatcher_addr.to_le_bytes());
    std::ptr::copy_nonoverlapping(template.as_ptr(), prologue_addr as *mut u8, template.len());

    set_prot(libc::PROT_READ | libc::PROT_EXEC)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_prologue_outside_any_mapping() {
        // Address 0 is never a valid executable mapping.
        assert!(matches!(
            check_mapping_bounds(0),
            Err(AgentError::MemoryProtectionFailed { .. })
        ));
    }

    #[test]
    fn accepts_a_prologue_inside_this_function_s_own_text_mapping() {
        let here = check_mapping_bounds as *const () as u64;
        // `here` sits well inside the executable's own text segment, which
        // is always larger than ULP_NOPS_LEN.
        assert!(check_mapping_bounds(here).is_ok());
    }
}
