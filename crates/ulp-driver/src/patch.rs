//! Top-level driver operations: wires C1 (ptrace), C2 (inspector) and C7
//! (hijack) together into the apply/revert/is-applied commands a caller
//! actually invokes (spec §6.4).

use std::io::Write;
use std::thread::sleep;
use std::time::Duration;

use ulp_common::{codec, PatchId, PatchMetadata};

use crate::error::{PatchError, ProcessError};
use crate::hijack::Hijack;
use crate::inspect::{self, AgentHandle};
use crate::mem::MemReader;
use crate::ptrace;

/// Converts a failure that occurred while a hijack critical section was
/// open into the right §7 error kind: a failed rollback leaves the target
/// potentially broken and is fatal, everything else is the ordinary
/// retryable `HijackFailed`.
fn hijack_error(e: ProcessError) -> PatchError {
    match e {
        ProcessError::RollbackFailed => PatchError::HijackFatal,
        _ => PatchError::HijackFailed,
    }
}

/// Bounded retry for the `testlocks` contract (SPEC_FULL §10.6): the
/// original's `tools/main.c`-level retry-on-`EAGAIN` loop, since a single
/// attempt would make `LocksHeld` a dead end rather than actionable.
const TESTLOCKS_MAX_ATTEMPTS: u32 = 10;
const TESTLOCKS_RETRY_DELAY: Duration = Duration::from_millis(1);

fn locate_agent(pid: i32, mem: &MemReader) -> Result<AgentHandle, PatchError> {
    let view = inspect::process_view(pid, mem).map_err(PatchError::Inspect)?;
    let nodes = inspect::walk_link_map(&view, mem).map_err(PatchError::Inspect)?;
    let classified = inspect::classify(&nodes);
    inspect::find_agent(&classified, mem).map_err(PatchError::Inspect)
}

/// Runs `testlocks`, retrying on `EAGAIN` by releasing every thread
/// briefly and re-attaching (SPEC_FULL §10.6).
fn testlocks_with_retry(pid: i32, handle: &AgentHandle) -> Result<(), PatchError> {
    for attempt in 0..TESTLOCKS_MAX_ATTEMPTS {
        let hijack = Hijack::begin(pid).map_err(hijack_error)?;
        let result = hijack.testlocks(handle.testlocks_addr).map_err(hijack_error)?;
        hijack.end().map_err(hijack_error)?;
        match result {
            0 => return Ok(()),
            -1 => return Err(PatchError::HijackFatal),
            _ => {
                log::debug!("testlocks held on attempt {attempt}, retrying");
                sleep(TESTLOCKS_RETRY_DELAY);
            }
        }
    }
    Err(PatchError::LocksHeld)
}

/// Stages `meta`'s encoded bytes in a temp file, writes its path into the
/// agent's path buffer, and redirects a thread into `__ulp_trigger` (spec
/// §4.3, §6.1, §6.3).
fn trigger_apply_or_revert(pid: i32, handle: &AgentHandle, meta: &PatchMetadata) -> Result<(), PatchError> {
    let mut staged = tempfile::NamedTempFile::new().map_err(|e| PatchError::LoadFailed(e.to_string()))?;
    let bytes = codec::encode(meta);
    staged
        .write_all(&bytes)
        .map_err(|e| PatchError::LoadFailed(e.to_string()))?;
    let path = staged.path().to_string_lossy().into_owned();

    let hijack = Hijack::begin(pid).map_err(hijack_error)?;
    ptrace::write_string(hijack.pid(), handle.path_buffer_addr, &path).map_err(hijack_error)?;
    let result = hijack.run_and_redirect(handle.trigger_addr).map_err(hijack_error)?;
    hijack.end().map_err(hijack_error)?;

    agent_result_to_error(result as i32)
}

fn agent_result_to_error(code: i32) -> Result<(), PatchError> {
    match code {
        0 => Ok(()),
        1 => Err(PatchError::AlreadyApplied(String::new())),
        2 => Err(PatchError::DependencyMissing(String::new())),
        3 => Err(PatchError::StillDependedOn(String::new())),
        4 => Err(PatchError::NotApplied(String::new())),
        5 => Err(PatchError::BuildIdMismatch),
        6 | 7 => Err(PatchError::SymbolMissing(String::new())),
        8 => Err(PatchError::LoadFailed(String::new())),
        9 => Err(PatchError::MemoryProtectionFailed { addr: 0, len: 0 }),
        other => Err(PatchError::AgentError(other)),
    }
}

/// Applies the patch described by `meta` to `pid` (spec §4.3, §4.4, §4.7).
pub fn apply(pid: i32, meta: &PatchMetadata) -> Result<(), PatchError> {
    let mem = MemReader::new(pid);
    let handle = locate_agent(pid, &mem)?;
    testlocks_with_retry(pid, &handle)?;
    trigger_apply_or_revert(pid, &handle, meta)
}

/// Reverts an applied patch (spec §4.4).
pub fn revert(pid: i32, patch_id: PatchId) -> Result<(), PatchError> {
    let mem = MemReader::new(pid);
    let handle = locate_agent(pid, &mem)?;
    let meta = PatchMetadata::revert(patch_id);
    trigger_apply_or_revert(pid, &handle, &meta)
}

/// Is-applied query (SPEC_FULL §10.6's ambient `is-applied` subcommand):
/// stages the id in the agent's id buffer and redirects into
/// `__ulp_check_patched`, reading the boolean back from the return
/// register.
pub fn is_applied(pid: i32, patch_id: PatchId) -> Result<bool, PatchError> {
    let mem = MemReader::new(pid);
    let handle = locate_agent(pid, &mem)?;

    let hijack = Hijack::begin(pid).map_err(hijack_error)?;
    ptrace::write_bytes(hijack.pid(), handle.id_buffer_addr, &patch_id.0).map_err(hijack_error)?;
    let result = hijack
        .run_and_redirect(handle.check_patched_addr)
        .map_err(hijack_error)?;
    hijack.end().map_err(hijack_error)?;

    Ok(result != 0)
}

/// Queries the process-wide `global_universe` counter (spec §6.3's
/// `__ulp_get_global_universe`). Ambient tooling in the same spirit as
/// `is_applied` (SPEC_FULL §10.6): §8's scenario 2 ("raise T's universe to
/// current global") needs a way to read the current value to raise to.
pub fn global_universe(pid: i32) -> Result<u64, PatchError> {
    let mem = MemReader::new(pid);
    let handle = locate_agent(pid, &mem)?;

    let hijack = Hijack::begin(pid).map_err(hijack_error)?;
    let result = hijack
        .run_and_redirect(handle.get_global_universe_addr)
        .map_err(hijack_error)?;
    hijack.end().map_err(hijack_error)?;

    Ok(result)
}

/// Queries the agent's own `__ulp_get_local_universe` export (spec §6.3).
pub fn local_universe(pid: i32) -> Result<u64, PatchError> {
    let mem = MemReader::new(pid);
    let handle = locate_agent(pid, &mem)?;

    let hijack = Hijack::begin(pid).map_err(hijack_error)?;
    let result = hijack
        .run_and_redirect(handle.get_local_universe_addr)
        .map_err(hijack_error)?;
    hijack.end().map_err(hijack_error)?;

    Ok(result)
}
