//! Symbols the driver depends on (spec §6.3): the agent's ABI surface,
//! reachable only by a thread the hijack protocol has redirected here.
//!
//! Every entry point begins with two bytes of ignorable prologue the
//! driver's redirected `rip` is biased past (spec §4.7's syscall-restart
//! note) — emitted here as a `nop; nop` via inline asm so the offset is
//! real machine bytes, not just a comment.

use std::ffi::CStr;
use std::fs::File;
use std::io::BufReader;

use ulp_common::abi::PATH_BUFFER_LEN;
use ulp_common::{codec, PatchId, PatchType, PATCH_ID_LEN};

use crate::error::AgentError;
use crate::state;

/// Staging buffer the driver writes a metadata file path into before
/// redirecting a thread to [`__ulp_trigger`] (spec §3, §6.3).
#[no_mangle]
pub static mut __ulp_path_buffer: [u8; PATH_BUFFER_LEN] = [0; PATH_BUFFER_LEN];

/// Staging buffer for an is-applied query's patch id (spec §3's
/// "32-byte id buffer").
#[no_mangle]
pub static mut __ulp_id_buffer: [u8; PATCH_ID_LEN] = [0; PATCH_ID_LEN];

/// First byte is `load_state` (spec §6.3): 0 until the constructor below
/// has run, 1 afterward. The driver's inspector (C2) refuses to proceed
/// while this reads 0 (`AgentNotReady`).
#[no_mangle]
pub static mut __ulp_state: [u8; 1] = [0];

#[ctor::ctor]
fn begin() {
    // SAFETY: runs once, before any other thread in the process can have
    // observed `__ulp_state`, per the dynamic loader's constructor
    // ordering guarantees.
    unsafe {
        __ulp_state[0] = 1;
    }
}

fn agent_error_code(e: &AgentError) -> i32 {
    match e {
        AgentError::AlreadyApplied(_) => 1,
        AgentError::DependencyMissing(_) => 2,
        AgentError::StillDependedOn(_) => 3,
        AgentError::NotApplied(_) => 4,
        AgentError::BuildIdMismatch => 5,
        AgentError::BuildIdRead(_) => 6,
        AgentError::SymbolMissing(_) => 7,
        AgentError::LoadFailed(_) => 8,
        AgentError::MemoryProtectionFailed { .. } => 9,
        AgentError::InvalidMetadata(_) => 10,
    }
}

/// Entry point the driver redirects a thread to after staging a metadata
/// path in [`__ulp_path_buffer`] (spec §4.3, §4.4). Reads and applies or
/// reverts the patch, returning 0 on success or a small positive error
/// code (see [`agent_error_code`]) the driver surfaces via §7's error
/// kinds.
///
/// # Safety
/// Must only be reached via the hijack protocol's redirected thread, with
/// every other thread in the process stopped (spec §4.7, §5).
#[no_mangle]
pub unsafe extern "C" fn __ulp_trigger() -> i32 {
    std::arch::asm!("nop", "nop");
    trigger_inner().err().map(|e| agent_error_code(&e)).unwrap_or(0)
}

unsafe fn trigger_inner() -> Result<(), AgentError> {
    #[allow(static_mut_refs)]
    let path_bytes = &__ulp_path_buffer;
    let path = CStr::from_bytes_until_nul(path_bytes)
        .map_err(|_| AgentError::LoadFailed("path buffer has no NUL terminator".into()))?
        .to_string_lossy()
        .into_owned();

    let file = File::open(&path).map_err(|e| AgentError::LoadFailed(format!("{path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let meta = codec::decode(&mut reader, false)?;

    match meta.kind {
        PatchType::Apply => state::apply(&meta),
        PatchType::Revert => state::revert(meta.patch_id),
    }
}

/// Is-applied query (spec §4.4): reads [`__ulp_id_buffer`] and returns
/// whether that id is currently applied, as 0/1 in the return register.
///
/// # Safety
/// Same redirected-thread requirement as [`__ulp_trigger`]; safe to run
/// outside a critical section too, since it only reads (spec §5).
#[no_mangle]
pub unsafe extern "C" fn __ulp_check_patched() -> i32 {
    std::arch::asm!("nop", "nop");
    #[allow(static_mut_refs)]
    let id = PatchId(__ulp_id_buffer);
    state::is_applied(&id) as i32
}

/// Spec §6.3: the process-wide monotone universe counter, incremented
/// once per successful apply or revert (invariant 4).
///
/// # Safety
/// Safe to call from the redirected thread at any time.
#[no_mangle]
pub unsafe extern "C" fn __ulp_get_global_universe() -> u64 {
    std::arch::asm!("nop", "nop");
    state::agent_state().global_universe
}

/// Spec §6.3. The agent process itself has no per-thread local-universe
/// state of its own (that concept belongs to each *target* library's
/// optional `__ulp_ret_local_universe`, spec §6.2) — this mirrors the
/// global counter so driver tooling built against this export still gets
/// a meaningful, monotone value.
///
/// # Safety
/// Safe to call from the redirected thread at any time.
#[no_mangle]
pub unsafe extern "C" fn __ulp_get_local_universe() -> u64 {
    std::arch::asm!("nop", "nop");
    state::agent_state().global_universe
}

/// Spec §4.7 step 5: probed before any allocator- or loader-reaching
/// routine. Contract: 0 if safe, `EAGAIN` if a relevant lock is held, -1
/// on fatal. Every other thread is already stopped by the time this runs,
/// so the only lock that could be held is one the hijacked thread itself
/// last left locked on a prior, unrelated reentry — which a bounded
/// allocate/free probe surfaces without risking a real deadlock.
///
/// # Safety
/// Must only run inside the hijack protocol's critical section, before
/// any other agent entry point in the same session (spec §4.7).
#[no_mangle]
pub unsafe extern "C" fn __ulp_testlocks() -> i32 {
    std::arch::asm!("nop", "nop");
    let probe = libc::malloc(1);
    if probe.is_null() {
        return libc::EAGAIN;
    }
    libc::free(probe);
    0
}
