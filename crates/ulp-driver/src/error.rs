//! Error kinds for the driver (spec §7, ambient stack §10.2): one enum per
//! component plus a top-level union `main` matches on to choose an exit
//! code, following the teacher's per-module error style.

use thiserror::Error;
use ulp_common::{ElfError, MetadataError};

use crate::auxv::AuxvError;

/// C1/C7: low-level process I/O failures. Mirrors the teacher's
/// `CopyFromProcessError` shape — the pid and address travel with the
/// source error rather than being lost to a bare `nix::Error`.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to attach to tid {tid}")]
    Attach { tid: i32, #[source] source: nix::Error },
    #[error("failed to detach from tid {tid}")]
    Detach { tid: i32, #[source] source: nix::Error },
    #[error("failed to read registers of tid {tid}")]
    GetRegs { tid: i32, #[source] source: nix::Error },
    #[error("failed to write registers of tid {tid}")]
    SetRegs { tid: i32, #[source] source: nix::Error },
    #[error("failed to resume tid {tid}")]
    Cont { tid: i32, #[source] source: nix::Error },
    #[error("waitpid failed for tid {tid}")]
    Wait { tid: i32, #[source] source: nix::Error },
    #[error("failed to read {length} bytes at {address:#x} of tid {tid}")]
    Read { tid: i32, address: u64, length: usize, #[source] source: nix::Error },
    #[error("failed to write {length} bytes at {address:#x} of tid {tid}")]
    Write { tid: i32, address: u64, length: usize, #[source] source: nix::Error },
    #[error("tid {tid} exited while being traced")]
    TargetExited { tid: i32 },
    #[error("tid {tid} stopped abnormally (core-dumped or signaled)")]
    AbnormalStop { tid: i32 },
    #[error("rollback of partially attached threads failed, target left in an unknown state")]
    RollbackFailed,
}

/// C2: target inspection failures.
#[derive(Debug, Error)]
pub enum InspectError {
    #[error(transparent)]
    Auxv(#[from] AuxvError),
    #[error("AT_PHENT does not match the expected 64-bit program header size")]
    UnexpectedPhent,
    #[error("no PT_DYNAMIC segment found in the target's program headers")]
    NoDynamicSegment,
    #[error("no DT_DEBUG entry found in the target's .dynamic section")]
    NoDebugEntry,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("no object in the link map exposes the agent's sentinel symbols")]
    AgentMissing,
    #[error("agent found but its constructor has not run yet (load_state == 0)")]
    AgentNotReady,
}

/// Top-level union `main` matches on (spec §7's error kinds), composed via
/// `#[from]` from the component errors, following `minidump_writer.rs`'s
/// crate-wide `Result` alias pattern.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Inspect(#[from] InspectError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("metadata build-id does not match the running library")]
    BuildIdMismatch,
    #[error("dependency {0} is not applied")]
    DependencyMissing(String),
    #[error("patch {0} is already applied")]
    AlreadyApplied(String),
    #[error("patch {0} is not applied")]
    NotApplied(String),
    #[error("patch {0} is still depended on")]
    StillDependedOn(String),
    #[error("symbol not found: {0}")]
    SymbolMissing(String),
    #[error("memory protection failed at {addr:#x} ({len} bytes)")]
    MemoryProtectionFailed { addr: u64, len: usize },
    #[error("allocator or dynamic-linker locks held, retry")]
    LocksHeld,
    #[error("hijack protocol failed")]
    HijackFailed,
    #[error("hijack protocol left the target in an inconsistent state")]
    HijackFatal,
    #[error("failed to load livepatch shared object: {0}")]
    LoadFailed(String),
    #[error("agent returned an unrecognized error code {0}")]
    AgentError(i32),
}

impl PatchError {
    /// Exit-code class (spec §7: "the driver's exit code encodes the
    /// class").
    pub fn exit_code(&self) -> i32 {
        match self {
            PatchError::Process(_) => 10,
            PatchError::Inspect(InspectError::AgentMissing) => 20,
            PatchError::Inspect(InspectError::AgentNotReady) => 21,
            PatchError::Inspect(_) => 22,
            PatchError::Metadata(_) => 30,
            PatchError::BuildIdMismatch => 31,
            PatchError::DependencyMissing(_) => 32,
            PatchError::AlreadyApplied(_) => 33,
            PatchError::NotApplied(_) => 34,
            PatchError::StillDependedOn(_) => 35,
            PatchError::SymbolMissing(_) => 36,
            PatchError::MemoryProtectionFailed { .. } => 37,
            PatchError::LocksHeld => 40,
            PatchError::HijackFailed => 41,
            PatchError::HijackFatal => 42,
            PatchError::LoadFailed(_) => 43,
            PatchError::AgentError(_) => 44,
        }
    }
}
