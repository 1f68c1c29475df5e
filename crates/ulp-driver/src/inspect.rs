//! Target inspector (spec §4.2, C2): derives the link map from the
//! auxiliary vector and `.dynamic`, then classifies each loaded object,
//! grounded on the original's `tools/introspection.c` (`dig_load_bias`)
//! and the teacher's `linux/auxv` module for the auxv source.

use goblin::container::{Container, Ctx, Endian};
use goblin::elf::program_header::{self, ProgramHeader};

use ulp_common::abi::{AGENT_SENTINEL_SYMBOLS, LIVEPATCH_FILENAME_MARKER, LOCAL_UNIVERSE_EXPORT};
use ulp_common::elf::ElfModule;

use crate::auxv;
use crate::error::InspectError;
use crate::mem::MemReader;

const DT_DEBUG: i64 = 21;
const R_MAP_OFFSET: u64 = 8; // struct r_debug: int r_version (+ padding) then link_map*
const LINK_MAP_L_ADDR_OFFSET: u64 = 0;
const LINK_MAP_L_NAME_OFFSET: u64 = 8;
const LINK_MAP_L_NEXT_OFFSET: u64 = 24;
const MAX_NAME_LEN: usize = 4096;

/// Where a process's dynamic linker keeps its bookkeeping (spec §4.2).
pub struct ProcessView {
    pub load_bias: u64,
    pub dyn_addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Agent,
    LivePatchableTarget,
    LivepatchByNameHeuristic,
    Generic,
}

pub struct ClassifiedObject {
    pub load_addr: u64,
    pub name: String,
    pub classification: Classification,
}

/// Runtime addresses of every agent ABI surface (spec §6.3), resolved
/// once C2 has identified the agent's link-map node.
pub struct AgentHandle {
    pub trigger_addr: u64,
    pub path_buffer_addr: u64,
    pub id_buffer_addr: u64,
    pub check_patched_addr: u64,
    pub state_addr: u64,
    pub get_global_universe_addr: u64,
    pub get_local_universe_addr: u64,
    pub testlocks_addr: u64,
}

/// Computes `load_bias` and `.dynamic`'s address from the target's
/// auxiliary vector and program headers (spec §4.2).
pub fn process_view(pid: i32, mem: &MemReader) -> Result<ProcessView, InspectError> {
    let aux = auxv::read_auxv(pid)?;
    let phdr_addr = aux.phdr().ok_or(InspectError::NoDynamicSegment)?;
    let phnum = aux.phnum().ok_or(InspectError::NoDynamicSegment)?;
    let phent = aux.phent().ok_or(InspectError::NoDynamicSegment)?;
    if phent != 56 {
        return Err(InspectError::UnexpectedPhent);
    }

    let mut raw = vec![0u8; phent as usize * phnum as usize];
    mem.read_exact(phdr_addr, &mut raw)
        .map_err(InspectError::Process)?;

    let ctx = Ctx::new(Container::Big, Endian::Little);
    let headers = ProgramHeader::parse(&raw, 0, phnum as usize, ctx)
        .map_err(|e| InspectError::Elf(ulp_common::ElfError::Goblin(e)))?;

    let phdr_header = headers
        .iter()
        .find(|h| h.p_type == program_header::PT_PHDR)
        .ok_or(InspectError::NoDynamicSegment)?;
    let load_bias = phdr_addr.wrapping_sub(phdr_header.p_vaddr);

    let dynamic_header = headers
        .iter()
        .find(|h| h.p_type == program_header::PT_DYNAMIC)
        .ok_or(InspectError::NoDynamicSegment)?;
    let dyn_addr = dynamic_header.p_vaddr + load_bias;

    let view = ProcessView { load_bias, dyn_addr };
    log::debug!(
        "pid {pid}: load_bias={:#x} dyn_addr={:#x}",
        view.load_bias,
        view.dyn_addr
    );
    Ok(view)
}

/// Walks `.dynamic` to `DT_DEBUG`, then the loader's link map (spec §4.2).
pub fn walk_link_map(view: &ProcessView, mem: &MemReader) -> Result<Vec<LinkMapNode>, InspectError> {
    let mut offset = 0u64;
    let mut debug_addr = None;
    loop {
        let tag = mem.read_u64(view.dyn_addr + offset).map_err(InspectError::Process)? as i64;
        let val = mem
            .read_u64(view.dyn_addr + offset + 8)
            .map_err(InspectError::Process)?;
        if tag == 0 {
            break;
        }
        if tag == DT_DEBUG {
            debug_addr = Some(val);
        }
        offset += 16;
    }
    let debug_addr = debug_addr.ok_or(InspectError::NoDebugEntry)?;
    let mut link_map_addr = mem
        .read_u64(debug_addr + R_MAP_OFFSET)
        .map_err(InspectError::Process)?;

    let mut nodes = Vec::new();
    while link_map_addr != 0 {
        let l_addr = mem
            .read_u64(link_map_addr + LINK_MAP_L_ADDR_OFFSET)
            .map_err(InspectError::Process)?;
        let l_name_ptr = mem
            .read_u64(link_map_addr + LINK_MAP_L_NAME_OFFSET)
            .map_err(InspectError::Process)?;
        let l_name = if l_name_ptr == 0 {
            String::new()
        } else {
            mem.read_cstring(l_name_ptr, MAX_NAME_LEN)
                .map_err(InspectError::Process)?
        };
        nodes.push(LinkMapNode {
            load_addr: l_addr,
            name: l_name,
        });
        link_map_addr = mem
            .read_u64(link_map_addr + LINK_MAP_L_NEXT_OFFSET)
            .map_err(InspectError::Process)?;
    }
    Ok(nodes)
}

pub struct LinkMapNode {
    pub load_addr: u64,
    pub name: String,
}

fn has_all_sentinels(module: &ElfModule<&[u8]>) -> bool {
    AGENT_SENTINEL_SYMBOLS
        .iter()
        .all(|sym| module.resolve_symbol(sym).is_ok())
}

/// Classifies every accepted link-map node (spec §4.2's "skip nodes whose
/// `l_name` is empty or not absolute" plus the classification rules).
pub fn classify(nodes: &[LinkMapNode]) -> Vec<(ClassifiedObject, Vec<u8>)> {
    let mut out = Vec::new();
    for node in nodes {
        if node.name.is_empty() || !node.name.starts_with('/') {
            continue;
        }
        let Ok(bytes) = std::fs::read(&node.name) else {
            continue;
        };
        let Ok(module) = ElfModule::new(bytes.as_slice()) else {
            continue;
        };
        let classification = if has_all_sentinels(&module) {
            Classification::Agent
        } else if module.resolve_symbol(LOCAL_UNIVERSE_EXPORT).is_ok() {
            Classification::LivePatchableTarget
        } else if node.name.contains(LIVEPATCH_FILENAME_MARKER) {
            Classification::LivepatchByNameHeuristic
        } else {
            Classification::Generic
        };
        out.push((
            ClassifiedObject {
                load_addr: node.load_addr,
                name: node.name.clone(),
                classification,
            },
            bytes,
        ));
    }
    out
}

/// Locates the agent among the classified objects, resolves every ABI
/// symbol's runtime address, and checks `load_state` (spec §4.2's
/// "AgentNotReady" rule).
pub fn find_agent(
    classified: &[(ClassifiedObject, Vec<u8>)],
    mem: &MemReader,
) -> Result<AgentHandle, InspectError> {
    let agents: Vec<_> = classified
        .iter()
        .filter(|(obj, _)| obj.classification == Classification::Agent)
        .collect();

    if agents.is_empty() {
        return Err(InspectError::AgentMissing);
    }
    if agents.len() > 1 {
        log::warn!(
            "multiple objects expose the agent's sentinel symbols: {:?}",
            agents.iter().map(|(o, _)| &o.name).collect::<Vec<_>>()
        );
    }

    let (obj, bytes) = agents[0];
    let module = ElfModule::new(bytes.as_slice()).map_err(InspectError::Elf)?;
    let resolve = |name: &str| -> Result<u64, InspectError> {
        module
            .resolve_symbol(name)
            .map(|vaddr| obj.load_addr + vaddr)
            .map_err(InspectError::Elf)
    };

    let handle = AgentHandle {
        trigger_addr: resolve("__ulp_trigger")?,
        path_buffer_addr: resolve("__ulp_path_buffer")?,
        id_buffer_addr: resolve("__ulp_id_buffer")?,
        check_patched_addr: resolve("__ulp_check_patched")?,
        state_addr: resolve("__ulp_state")?,
        get_global_universe_addr: resolve("__ulp_get_global_universe")?,
        get_local_universe_addr: resolve("__ulp_get_local_universe")?,
        testlocks_addr: resolve("__ulp_testlocks")?,
    };

    let mut load_state = [0u8; 1];
    mem.read_exact(handle.state_addr, &mut load_state)
        .map_err(InspectError::Process)?;
    if load_state[0] == 0 {
        return Err(InspectError::AgentNotReady);
    }

    Ok(handle)
}
