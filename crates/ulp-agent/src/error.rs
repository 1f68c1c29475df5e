//! Agent-side error kinds (spec §7, scoped to what the in-process engine
//! itself can fail at; hijack/process-level kinds live in `ulp-driver`).

use thiserror::Error;
use ulp_common::{ElfError, MetadataError, PatchId};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to parse patch metadata")]
    InvalidMetadata(#[from] MetadataError),
    #[error("failed to read build id of the target object")]
    BuildIdRead(#[source] ElfError),
    #[error("build id mismatch for target object")]
    BuildIdMismatch,
    #[error("dependency {0} is not applied")]
    DependencyMissing(PatchId),
    #[error("patch {0} is still depended on")]
    StillDependedOn(PatchId),
    #[error("patch {0} is already applied")]
    AlreadyApplied(PatchId),
    #[error("patch {0} is not applied")]
    NotApplied(PatchId),
    #[error("failed to resolve symbol {0:?}")]
    SymbolMissing(String),
    #[error("failed to load shared object {0:?}")]
    LoadFailed(String),
    #[error("failed to set memory protection on [{addr:#x}, {addr:#x} + {len:#x})")]
    MemoryProtectionFailed { addr: u64, len: usize },
}
