//! The wire/in-memory data model for patch metadata (spec §3).

use std::fmt;

/// Number of bytes in a patch identifier.
pub const PATCH_ID_LEN: usize = 32;

/// Uniquely identifies a patch.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchId(pub [u8; PATCH_ID_LEN]);

impl fmt::Debug for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether a metadata file describes applying a new patch or reverting one
/// already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Apply = 1,
    Revert = 2,
}

impl PatchType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Apply),
            2 => Some(Self::Revert),
            _ => None,
        }
    }
}

/// One function replacement within a [`PatchedObject`].
#[derive(Debug, Clone)]
pub struct PatchUnit {
    /// Symbol name in the target library (resolved through its `.ulp`
    /// jump-slot, see spec §6.2).
    pub old_fname: String,
    /// Symbol name in the livepatch shared object.
    pub new_fname: String,
    /// Author-supplied address hint. Never trusted; kept only for
    /// diagnostics.
    pub old_faddr: u64,
}

/// The library whose functions are being replaced.
#[derive(Debug, Clone)]
pub struct PatchedObject {
    /// Raw bytes of the `NT_GNU_BUILD_ID` note of the running library.
    pub build_id: Vec<u8>,
    /// Absolute path used when the loader mapped this library.
    pub name: String,
    pub units: Vec<PatchUnit>,
}

/// Parsed form of a patch metadata file (spec §6.1).
#[derive(Debug, Clone)]
pub struct PatchMetadata {
    pub kind: PatchType,
    pub patch_id: PatchId,
    /// Absolute path to the livepatch shared object. Only meaningful for
    /// [`PatchType::Apply`].
    pub so_filename: Option<String>,
    /// The single patched library. Only meaningful for
    /// [`PatchType::Apply`].
    pub target: Option<PatchedObject>,
    /// Patches that must already be applied before this one may be.
    pub deps: Vec<PatchId>,
}

impl PatchMetadata {
    pub fn revert(patch_id: PatchId) -> Self {
        PatchMetadata {
            kind: PatchType::Revert,
            patch_id,
            so_filename: None,
            target: None,
            deps: Vec::new(),
        }
    }
}
