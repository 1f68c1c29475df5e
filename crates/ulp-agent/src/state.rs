//! Agent state engine (spec §4.4, C4): apply, revert, and the is-applied
//! query, plus the process-wide singleton they operate on.

use ulp_common::abi::LOCAL_UNIVERSE_SYMBOL;
use ulp_common::elf::ElfModule;
use ulp_common::{PatchId, PatchMetadata};

use crate::dispatcher::prologue_trampoline_addr;
use crate::error::AgentError;
use crate::loader;
use crate::model::{AgentState, AppliedPatch, AppliedUnit, Detour, DetourRoot};
use crate::rewriter;

/// Process-wide agent state (spec §3 "Global state"). Per SPEC_FULL §9,
/// the usual mutation discipline is bypassed here *with justification*:
/// the hijack protocol (§5, `ulp-driver`'s C7) guarantees that whenever
/// this is mutated, every other thread in the process is externally
/// stopped, so there is never a concurrent writer — only concurrent
/// *readers* (the dispatcher, from other threads, outside critical
/// sections), which plain shared references already make sound.
static mut AGENT: AgentState = AgentState::new();

/// # Safety
/// Callers must only call this from the single hijacked mutator thread
/// while holding the hijack critical section (for writes), or accept that
/// concurrent reads race only with *no* writer (for the dispatcher's hot
/// path, see [`AGENT`]'s doc comment).
pub unsafe fn agent_state() -> &'static mut AgentState {
    #[allow(static_mut_refs)]
    &mut AGENT
}

/// # Safety
/// `target_handle` must be a valid, still-open loader handle.
unsafe fn resolve_local_universe_fn(
    target_handle: *mut std::ffi::c_void,
) -> Option<crate::model::LocalUniverseFn> {
    let addr = loader::dlsym_addr(target_handle, LOCAL_UNIVERSE_SYMBOL).ok()?;
    // SAFETY: the symbol, if present, is documented (spec §6.2) to have
    // the `extern "C" fn() -> u64` signature.
    Some(std::mem::transmute::<u64, crate::model::LocalUniverseFn>(addr))
}

/// Applies a patch (spec §4.4 "Apply", steps 1-6).
///
/// # Safety
/// Must run inside the hijack protocol's critical section (spec §4.7):
/// every other thread in the process must be stopped for the duration.
pub unsafe fn apply(meta: &PatchMetadata) -> Result<(), AgentError> {
    let target = meta
        .target
        .as_ref()
        .ok_or_else(|| AgentError::LoadFailed("apply metadata missing target".into()))?;
    let so_filename = meta
        .so_filename
        .as_deref()
        .ok_or_else(|| AgentError::LoadFailed("apply metadata missing so_filename".into()))?;

    {
        let state = agent_state();
        if state.is_applied(&meta.patch_id) {
            return Err(AgentError::AlreadyApplied(meta.patch_id));
        }
        for dep in &meta.deps {
            if !state.is_applied(dep) {
                return Err(AgentError::DependencyMissing(*dep));
            }
        }
    }

    let base = loader::find_loaded_object(&target.name)
        .ok_or_else(|| AgentError::LoadFailed(target.name.clone()))?;
    // Read the library's own file rather than its mapped image: section
    // headers (needed for the build-id/section fallback tiers and for
    // dynamic symbol lookup) generally aren't themselves mapped at
    // runtime, only PT_LOAD segments are. File offsets and on-disk symbol
    // values equal their runtime counterparts once biased by `base`.
    let so_file = std::fs::File::open(&target.name)
        .map_err(|e| AgentError::LoadFailed(format!("{}: {e}", target.name)))?;
    // SAFETY: the file is a regular ELF shared object on disk; nothing else
    // in this process concurrently truncates it while we read it here.
    let so_mmap = unsafe { memmap2::Mmap::map(&so_file) }
        .map_err(|e| AgentError::LoadFailed(format!("{}: {e}", target.name)))?;
    let module = ElfModule::new(&so_mmap[..]).map_err(AgentError::BuildIdRead)?;
    let running_build_id = module.build_id().map_err(AgentError::BuildIdRead)?;
    if running_build_id != target.build_id {
        return Err(AgentError::BuildIdMismatch);
    }

    let target_handle = loader::dlopen_noload(&target.name)?;
    let patch_handle = loader::dlopen_now(so_filename)?;
    let dispatcher_addr = prologue_trampoline_addr();

    // Resolve every unit's real addresses and snapshot overwritten bytes
    // before mutating any shared state (spec §5 ordering guarantee).
    struct Resolved {
        patched_addr: u64,
        target_addr: u64,
        overwritten: [u8; 14],
    }
    let mut resolved = Vec::with_capacity(target.units.len());
    for unit in &target.units {
        let slot_vaddr = module
            .resolve_symbol(&unit.old_fname)
            .map_err(|_| AgentError::SymbolMissing(unit.old_fname.clone()))?;
        let slot_addr = base + slot_vaddr;
        let mut insn = [0u8; ulp_common::abi::ULP_JUMP_SLOT_INSN_LEN];
        std::ptr::copy_nonoverlapping(slot_addr as *const u8, insn.as_mut_ptr(), insn.len());
        let patched_addr = ulp_common::elf::resolve_ulp_jump_slot(slot_addr, &insn);
        let target_addr = loader::dlsym_addr(patch_handle, &unit.new_fname)
            .map_err(|_| AgentError::SymbolMissing(unit.new_fname.clone()))?;
        let overwritten = rewriter::snapshot_overwritten_bytes(patched_addr);
        resolved.push(Resolved {
            patched_addr,
            target_addr,
            overwritten,
        });
    }

    let local_universe_fn = resolve_local_universe_fn(target_handle);

    // From here on we mutate: bump the universe counter once (invariant
    // 4, spec §3), then register and rewrite each unit.
    let state = agent_state();
    state.global_universe += 1;
    let universe = state.global_universe;

    let mut applied_units = Vec::with_capacity(resolved.len());
    for r in &resolved {
        let index = match state.find_root(r.patched_addr) {
            Some(root) => root.index,
            None => {
                let index = state.roots.len() as u64;
                state
                    .roots
                    .push(DetourRoot::new(index, r.patched_addr, local_universe_fn));
                index
            }
        };
        let root = state
            .find_root_mut(r.patched_addr)
            .expect("just inserted or found above");
        root.push_detour(Detour {
            universe,
            patch_id: meta.patch_id,
            target_addr: r.target_addr,
            active: true,
        });
        // A failure here is fatal (spec §4.4): the detour record already
        // exists, so a rewrite failure would leave the dispatcher routing
        // to an address whose call site was never actually patched.
        rewriter::patch_call_site(r.patched_addr, index as u32, dispatcher_addr)
            .unwrap_or_else(|e| panic!("call-site rewrite failed after detour install: {e}"));
        applied_units.push(AppliedUnit {
            patched_addr: r.patched_addr,
            target_addr: r.target_addr,
            overwritten_bytes: r.overwritten,
        });
    }

    state.applied.insert(
        0,
        AppliedPatch {
            patch_id: meta.patch_id,
            units: applied_units,
            deps: meta.deps.clone(),
        },
    );
    Ok(())
}

/// Reverts a patch (spec §4.4 "Revert", steps 1-5).
///
/// # Safety
/// Same critical-section requirement as [`apply`].
pub unsafe fn revert(patch_id: PatchId) -> Result<(), AgentError> {
    let state = agent_state();
    if !state.is_applied(&patch_id) {
        return Err(AgentError::NotApplied(patch_id));
    }
    if state.depends_on(&patch_id) {
        return Err(AgentError::StillDependedOn(patch_id));
    }

    state.global_universe += 1;

    for root in &mut state.roots {
        for detour in &mut root.detours {
            if detour.patch_id == patch_id {
                detour.active = false;
            }
        }
    }

    state.applied.retain(|p| p.patch_id != patch_id);
    Ok(())
}

/// Is-applied query (spec §4.4): a linear scan of the applied list.
///
/// # Safety
/// May be called outside a critical section: it only reads, and per §5
/// reads never race a writer (the only writer is the single hijacked
/// mutator thread, which runs with every other thread stopped).
pub unsafe fn is_applied(patch_id: &PatchId) -> bool {
    agent_state().is_applied(patch_id)
}
