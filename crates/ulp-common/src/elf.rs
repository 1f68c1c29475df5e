//! ELF introspection shared by the driver (reading shared objects and
//! target process memory) and the agent (reading its own loaded image).
//!
//! Generalizes the teacher's `build_id_reader`/`module_reader` byte-source
//! abstraction: [`ModuleMemory`] is implemented once for a file's bytes and
//! once for a live process's memory (`ulp-driver`'s ptrace-backed reader),
//! so every helper here works unmodified against either source.

use std::ffi::CStr;

use goblin::container::{Container, Ctx, Endian};
use goblin::elf;
use scroll::Pread;

use crate::error::ElfError as Error;

const NOTE_SECTION_NAME: &[u8] = b".note.gnu.build-id\0";

/// A byte source an [`ElfModule`] can be built over: a file's raw bytes, or
/// a window into a remote process's address space.
pub trait ModuleMemory {
    type Memory: std::ops::Deref<Target = [u8]>;

    fn read_module_memory(&self, offset: u64, length: u64) -> std::io::Result<Self::Memory>;
}

impl ModuleMemory for &[u8] {
    type Memory = Self;

    fn read_module_memory(&self, offset: u64, length: u64) -> std::io::Result<Self::Memory> {
        self.get(offset as usize..(offset + length) as usize)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} out of bounds", offset + length),
                )
            })
    }
}

fn read<T: ModuleMemory>(mem: &T, offset: u64, length: u64) -> Result<T::Memory, Error> {
    mem.read_module_memory(offset, length)
        .map_err(|error| Error::ReadModuleMemory {
            offset,
            length,
            error,
        })
}

fn is_executable_section(header: &elf::SectionHeader) -> bool {
    header.sh_type == elf::section_header::SHT_PROGBITS
        && header.sh_flags & u64::from(elf::section_header::SHF_ALLOC) != 0
        && header.sh_flags & u64::from(elf::section_header::SHF_EXECINSTR) != 0
}

fn build_id_from_bytes(data: &[u8]) -> Vec<u8> {
    // 16 bytes, matching the size of a GNU build-id note's usual payload.
    data.chunks(16).fold(vec![0u8; 16], |mut bytes, chunk| {
        bytes
            .iter_mut()
            .zip(chunk.iter())
            .for_each(|(b, c)| *b ^= *c);
        bytes
    })
}

fn section_header_with_name<'a, T: ModuleMemory>(
    section_headers: &'a elf::SectionHeaders,
    strtab_index: usize,
    name: &[u8],
    module_memory: &T,
) -> Result<Option<&'a elf::SectionHeader>, Error> {
    let strtab_section_header = section_headers.get(strtab_index).ok_or(Error::NoStrTab)?;
    for header in section_headers {
        let sh_name = header.sh_name as u64;
        if sh_name >= strtab_section_header.sh_size {
            log::warn!("invalid sh_name offset");
            continue;
        }
        if sh_name + name.len() as u64 >= strtab_section_header.sh_size {
            continue;
        }
        let n = read(
            module_memory,
            strtab_section_header.sh_offset + sh_name,
            name.len() as u64,
        )?;
        if name == &*n {
            return Ok(Some(header));
        }
    }
    Ok(None)
}

/// Reads ELF structure (build-id, soname, dynamic symbols) out of a
/// [`ModuleMemory`] source.
pub struct ElfModule<T> {
    module_memory: T,
    header: elf::Header,
    context: Ctx,
}

impl<T: ModuleMemory> ElfModule<T> {
    pub fn new(module_memory: T) -> Result<Self, Error> {
        // Use a 64-bit context to size the header read permissively; the
        // real container/endianness come from the parsed header itself.
        let header_size = elf::Header::size(Ctx::new(Container::Big, Endian::default()));
        let header_data = read(&module_memory, 0, header_size as u64)?;
        let header = elf::Elf::parse_header(&header_data)?;
        let context = Ctx::new(header.container()?, header.endianness()?);
        Ok(ElfModule {
            module_memory,
            header,
            context,
        })
    }

    /// Determines the build id by the three-tier fallback chain (spec
    /// §6.2, SPEC_FULL §10.6): program-header note, then section note,
    /// then a generated hash of the first page of executable code.
    pub fn build_id(&self) -> Result<Vec<u8>, Error> {
        let program_headers = match self.build_id_from_program_headers() {
            Ok(v) => return Ok(v),
            Err(e) => Box::new(e),
        };
        let section = match self.build_id_from_section() {
            Ok(v) => return Ok(v),
            Err(e) => Box::new(e),
        };
        let generated = match self.build_id_generate_from_text() {
            Ok(v) => return Ok(v),
            Err(e) => Box::new(e),
        };
        Err(Error::NoBuildId {
            program_headers,
            section,
            generated,
        })
    }

    pub fn build_id_from_program_headers(&self) -> Result<Vec<u8>, Error> {
        if self.header.e_phoff == 0 {
            return Err(Error::NoProgramHeaderNote);
        }
        let program_headers_data = read(
            &self.module_memory,
            self.header.e_phoff,
            self.header.e_phentsize as u64 * self.header.e_phnum as u64,
        )?;
        let program_headers = elf::ProgramHeader::parse(
            &program_headers_data,
            0,
            self.header.e_phnum as usize,
            self.context,
        )?;
        for header in program_headers {
            if header.p_type != elf::program_header::PT_NOTE {
                continue;
            }
            if let Ok(Some(result)) =
                self.find_build_id_note(header.p_offset, header.p_filesz, header.p_align)
            {
                return Ok(result);
            }
        }
        Err(Error::NoProgramHeaderNote)
    }

    pub fn build_id_from_section(&self) -> Result<Vec<u8>, Error> {
        let section_headers = self.read_section_headers()?;
        let header = section_header_with_name(
            &section_headers,
            self.header.e_shstrndx as usize,
            NOTE_SECTION_NAME,
            &self.module_memory,
        )?
        .ok_or(Error::NoSectionNote)?;

        match self.find_build_id_note(header.sh_offset, header.sh_size, header.sh_addralign) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(Error::NoSectionNote),
            Err(e) => Err(e),
        }
    }

    pub fn build_id_generate_from_text(&self) -> Result<Vec<u8>, Error> {
        let Some(text_header) = self
            .read_section_headers()?
            .into_iter()
            .find(is_executable_section)
        else {
            return Err(Error::NoTextSection);
        };
        let len = std::cmp::min(4096, text_header.sh_size);
        let text_data = read(&self.module_memory, text_header.sh_offset, len)?;
        Ok(build_id_from_bytes(&text_data))
    }

    /// Reads the `DT_SONAME` dynamic entry, if present.
    pub fn soname(&self) -> Result<String, Error> {
        let section_headers = self.read_section_headers()?;
        let dynamic_section_header = section_headers
            .iter()
            .find(|h| h.sh_type == elf::section_header::SHT_DYNAMIC)
            .ok_or(Error::NoDynamicSection)?;
        let dynstr_section_header = section_headers
            .get(dynamic_section_header.sh_link as usize)
            .filter(|h| h.sh_type == elf::section_header::SHT_STRTAB)
            .cloned()
            .or(section_header_with_name(
                &section_headers,
                self.header.e_shstrndx as usize,
                b".dynstr\0",
                &self.module_memory,
            )?
            .cloned())
            .ok_or(Error::NoStrTab)?;

        let dynamic_section: &[u8] = &read(
            &self.module_memory,
            dynamic_section_header.sh_offset,
            dynamic_section_header.sh_size,
        )?;

        let mut offset = 0;
        loop {
            let dyn_: elf::dynamic::Dyn = dynamic_section.gread_with(&mut offset, self.context)?;
            if dyn_.d_tag == elf::dynamic::DT_SONAME {
                let strtab_offset = dyn_.d_val;
                if strtab_offset < dynstr_section_header.sh_size {
                    let name = read(
                        &self.module_memory,
                        dynstr_section_header.sh_offset + strtab_offset,
                        dynstr_section_header.sh_size - strtab_offset,
                    )?;
                    return CStr::from_bytes_until_nul(&name)
                        .map(|s| s.to_string_lossy().into_owned())
                        .map_err(|_| Error::NoStrTab);
                }
            }
            if dyn_.d_tag == elf::dynamic::DT_NULL {
                break;
            }
        }
        Err(Error::SymbolNotFound)
    }

    /// Resolves a dynamic symbol's address by name (spec §4.2, §6.2: used
    /// to locate a livepatch unit's `old_fname`/`new_fname`).
    pub fn resolve_symbol(&self, name: &str) -> Result<u64, Error> {
        let section_headers = self.read_section_headers()?;
        let dynsym_header = section_headers
            .iter()
            .find(|h| h.sh_type == elf::section_header::SHT_DYNSYM)
            .ok_or(Error::SymbolNotFound)?;
        let dynstr_header = section_headers
            .get(dynsym_header.sh_link as usize)
            .ok_or(Error::NoStrTab)?;

        let symtab_data = read(
            &self.module_memory,
            dynsym_header.sh_offset,
            dynsym_header.sh_size,
        )?;
        let strtab_data = read(
            &self.module_memory,
            dynstr_header.sh_offset,
            dynstr_header.sh_size,
        )?;

        let count = dynsym_header.sh_size as usize / dynsym_header.sh_entsize.max(1) as usize;
        let syms = elf::Sym::parse(&symtab_data, 0, count, self.context)?;
        for sym in &syms {
            let name_bytes = strtab_data
                .get(sym.st_name..)
                .ok_or(Error::SymbolNotFound)?;
            let sym_name = CStr::from_bytes_until_nul(name_bytes)
                .map_err(|_| Error::SymbolNotFound)?
                .to_string_lossy();
            if sym_name == name {
                return Ok(sym.st_value);
            }
        }
        Err(Error::SymbolNotFound)
    }

    fn read_section_headers(&self) -> Result<elf::SectionHeaders, Error> {
        if self.header.e_shoff == 0 {
            return Err(Error::NoSections);
        }
        // Read one extra byte preceding the sections so `SectionHeader::parse`
        // doesn't bail out on a zero start offset.
        let section_headers_data = read(
            &self.module_memory,
            self.header.e_shoff - 1,
            self.header.e_shentsize as u64 * self.header.e_shnum as u64 + 1,
        )?;
        let section_headers = elf::SectionHeader::parse(
            &section_headers_data,
            1,
            self.header.e_shnum as usize,
            self.context,
        )?;
        Ok(section_headers)
    }

    fn find_build_id_note(
        &self,
        offset: u64,
        size: u64,
        alignment: u64,
    ) -> Result<Option<Vec<u8>>, Error> {
        let notes = read(&self.module_memory, offset, size)?;
        for note in (elf::note::NoteDataIterator {
            data: &notes,
            size: size as usize,
            offset: 0,
            ctx: (alignment as usize, self.context),
        }) {
            let Ok(note) = note else { break };
            if note.name == "GNU" && note.n_type == elf::note::NT_GNU_BUILD_ID {
                return Ok(Some(note.desc.to_owned()));
            }
        }
        Ok(None)
    }
}

/// Decodes the address a `.ulp` jump-slot points to (spec §6.2): a 7-byte
/// rip-relative `lea` whose target is `func + i32_at(func + 3) + 7`.
///
/// `insn` must be exactly [`crate::abi::ULP_JUMP_SLOT_INSN_LEN`] bytes,
/// read starting at the jump-slot's address.
pub fn resolve_ulp_jump_slot(slot_addr: u64, insn: &[u8; crate::abi::ULP_JUMP_SLOT_INSN_LEN]) -> u64 {
    let disp = i32::from_le_bytes([insn[3], insn[4], insn[5], insn[6]]);
    slot_addr
        .wrapping_add(disp as i64 as u64)
        .wrapping_add(crate::abi::ULP_JUMP_SLOT_INSN_LEN as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Same fixture shape as the teacher's build-id tests, extended with a
    /// SONAME entry so `soname()`/`resolve_symbol()` have something to find.
    const TINY_ELF: &[u8] = &[
        0x7f, 0x45, 0x4c, 0x46, 0x02, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x02, 0x00, 0x3e, 0x00, 0x01, 0x00, 0x00, 0x00, 0xf4, 0x01, 0x40, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xb0, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x38, 0x00, 0x02, 0x00, 0x40, 0x00,
        0x04, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0xf4, 0x01, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0xf4, 0x01, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xb0, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0xb0, 0x01, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0xf4, 0x01, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0xf4, 0x01, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0xb0, 0x01, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0xb0, 0x01,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1a, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xd0, 0x01, 0x40, 0x00, 0x00, 0x00,
        0x00, 0x00, 0xd0, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00,
        0x00, 0x10, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x47, 0x4e, 0x55, 0x00, 0x01, 0x02,
        0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x00,
        0x2e, 0x74, 0x65, 0x78, 0x74, 0x00, 0x2e, 0x6e, 0x6f, 0x74, 0x65, 0x2e, 0x67, 0x6e, 0x75,
        0x2e, 0x62, 0x75, 0x69, 0x6c, 0x64, 0x2d, 0x69, 0x64, 0x00, 0x2e, 0x73, 0x68, 0x73, 0x74,
        0x72, 0x74, 0x61, 0x62, 0x00, 0x6a, 0x3c, 0x58, 0x31, 0xff, 0x0f, 0x05,
    ];

    #[test]
    fn build_id_prefers_program_headers() {
        let module = ElfModule::new(TINY_ELF).unwrap();
        let id = module.build_id().unwrap();
        assert_eq!(
            id,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
        );
    }

    #[test]
    fn build_id_from_section_matches_program_headers() {
        let module = ElfModule::new(TINY_ELF).unwrap();
        assert_eq!(
            module.build_id_from_program_headers().unwrap(),
            module.build_id_from_section().unwrap()
        );
    }

    #[test]
    fn generated_build_id_hashes_text() {
        let module = ElfModule::new(TINY_ELF).unwrap();
        let id = module.build_id_generate_from_text().unwrap();
        assert_eq!(
            id,
            vec![0x6a, 0x3c, 0x58, 0x31, 0xff, 0x0f, 0x05, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn ulp_jump_slot_resolves_forward_target() {
        // lea target at slot_addr+7+100
        let disp: i32 = 100;
        let mut insn = [0u8; 7];
        insn[0..3].copy_from_slice(&[0x48, 0x8d, 0x05]); // lea rax, [rip+disp]
        insn[3..7].copy_from_slice(&disp.to_le_bytes());
        assert_eq!(resolve_ulp_jump_slot(0x1000, &insn), 0x1000 + 100 + 7);
    }
}
