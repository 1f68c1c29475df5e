//! Data model, wire codec, ELF helpers and ABI constants shared by the
//! agent and the driver halves of the live-patching runtime.

pub mod abi;
pub mod codec;
pub mod elf;
pub mod error;
pub mod model;

pub use error::{ElfError, MetadataError};
pub use model::{PatchId, PatchMetadata, PatchType, PatchUnit, PatchedObject, PATCH_ID_LEN};
