//! Error kinds for the metadata codec and ELF helpers shared by the agent
//! and the driver (spec §7, ambient stack §10.2).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("I/O error reading patch metadata")]
    Io(#[source] std::io::Error),
    #[error("patch metadata string was not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown patch metadata type byte: {0}")]
    UnknownType(u8),
}

/// Errors surfaced while reading ELF structures (build-id notes, symbols)
/// from either a file on disk or a remote process's memory.
///
/// Mirrors the teacher's `build_id_reader::Error` shape: an aggregate
/// variant retains every fallback's failure so callers can report why
/// *each* strategy failed rather than only the last one tried.
#[derive(Debug, Error)]
pub enum ElfError {
    #[error("failed to read {length} bytes at offset {offset}")]
    ReadModuleMemory {
        offset: u64,
        length: u64,
        #[source]
        error: std::io::Error,
    },
    #[error(transparent)]
    Goblin(#[from] goblin::error::Error),
    #[error("no program-header note found")]
    NoProgramHeaderNote,
    #[error("no section-header note found")]
    NoSectionNote,
    #[error("no executable section to hash")]
    NoTextSection,
    #[error("no section headers present")]
    NoSections,
    #[error("no string table section present")]
    NoStrTab,
    #[error("no symbol with that name")]
    SymbolNotFound,
    #[error("no dynamic section present")]
    NoDynamicSection,
    #[error("could not determine a build id by any strategy")]
    NoBuildId {
        program_headers: Box<ElfError>,
        section: Box<ElfError>,
        generated: Box<ElfError>,
    },
}
