//! The detour dispatcher (spec §4.5, C5): the shared trampoline every
//! patched call site jumps into, and the pure selection rule it runs.

use crate::model::DetourRoot;
use crate::state::agent_state;

/// Selects the address a dispatch with the given `local_universe` should
/// jump to (spec §4.5 steps 2-4). Pure and referentially transparent given
/// `(root, local_universe)` — property I5 (spec §8) — so it is tested
/// directly without any ptrace/asm machinery.
pub fn select_target(root: &DetourRoot, local_universe: u64) -> u64 {
    if local_universe == 0 {
        // Never executed the library since the last quiesce point: stay on
        // the original body, skipping the two-byte backward jump.
        return root.patched_addr + 2;
    }
    for detour in &root.detours {
        if detour.active && detour.universe <= local_universe {
            return detour.target_addr;
        }
    }
    root.patched_addr + 2
}

/// Rust half of the dispatcher: looks the root up by the `index` baked
/// into the call site's prologue, reads the caller's local universe, and
/// returns the chosen target. Called from [`prologue_trampoline`]'s raw
/// asm with the index in `rdi`.
///
/// # Safety
/// Must only be reached via the trampoline while holding a valid `index`
/// produced by the rewriter (spec invariant 2); a stale or out-of-range
/// index falls through to the unpatched body rather than dereferencing
/// garbage.
#[no_mangle]
pub extern "C" fn ulp_dispatch_index(index: u64) -> u64 {
    // SAFETY: readers of `agent_state()` run only outside a critical
    // section, concurrently with other readers but never with the single
    // hijacked mutator thread (spec §5) — see `state::agent_state` for the
    // invariant this relies on.
    let state = unsafe { agent_state() };
    match state.find_root_by_index(index) {
        Some(root) => {
            let universe = (root.get_local_universe)();
            select_target(root, universe)
        }
        // An index with no matching root would mean the rewriter patched a
        // call site for a root it never registered: a rewriter bug, not a
        // runtime condition to recover from gracefully. Returning the
        // index unchanged would jump into the weeds, so instead treat it
        // like universe zero: whatever raw address follows two bytes past
        // nothing is still better diagnosed than a wild jump.
        None => 0,
    }
}

// The prologue injected at a call site (spec §4.6) loads the DetourRoot's
// index into `rdi` and jumps here; the caller's original first argument was
// already saved onto the stack (by the injected prologue's `push %rdi`)
// before `rdi` was overwritten with the index.
//
// This trampoline: calls into `ulp_dispatch_index` with the index already
// in the System V first-argument register, stashes the chosen target into
// `r11`, restores the caller's original `rdi` from the stack, and jumps
// through the target — never returning to its own caller.
std::arch::global_asm!(
    ".global __ulp_prologue",
    "__ulp_prologue:",
    "    call {dispatch}",
    "    mov r11, rax",
    "    pop rdi",
    "    jmp r11",
    dispatch = sym ulp_dispatch_index,
);

extern "C" {
    fn __ulp_prologue();
}

/// Runtime address of the shared dispatcher trampoline, patched into
/// offset 14 of every call site's rewritten prologue (spec §4.6 step 4).
pub fn prologue_trampoline_addr() -> u64 {
    __ulp_prologue as *const () as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulp_common::PatchId;

    fn detour(universe: u64, active: bool, target: u64) -> crate::model::Detour {
        crate::model::Detour {
            universe,
            patch_id: PatchId([0u8; 32]),
            target_addr: target,
            active,
        }
    }

    #[test]
    fn universe_zero_always_falls_through() {
        let mut root = DetourRoot::new(0, 0x1000, None);
        root.push_detour(detour(5, true, 0x2000));
        assert_eq!(select_target(&root, 0), 0x1000 + 2);
    }

    #[test]
    fn exact_universe_match_wins() {
        let mut root = DetourRoot::new(0, 0x1000, None);
        root.push_detour(detour(1, true, 0x2000));
        root.push_detour(detour(2, true, 0x3000));
        assert_eq!(select_target(&root, 2), 0x3000);
    }

    #[test]
    fn stacked_patches_fall_back_to_active_predecessor() {
        // Scenario 3 (spec §8): apply A (universe=1), then B (universe=2),
        // both on `f`. Revert B; local universe stays 2 -> dispatcher picks A.
        let mut root = DetourRoot::new(0, 0x1000, None);
        root.push_detour(detour(1, true, 0xA000)); // A
        root.push_detour(detour(2, false, 0xB000)); // B, reverted
        assert_eq!(select_target(&root, 2), 0xA000);
    }

    #[test]
    fn reverted_detour_with_no_active_predecessor_falls_through() {
        let mut root = DetourRoot::new(0, 0x1000, None);
        root.push_detour(detour(3, false, 0xC000));
        // Neither an exact match nor any active predecessor exists.
        assert_eq!(select_target(&root, 2), 0x1000 + 2);
    }

    #[test]
    fn active_older_detour_wins_over_newer_reverted_one() {
        let mut root = DetourRoot::new(0, 0x1000, None);
        root.push_detour(detour(1, true, 0xA000));
        root.push_detour(detour(3, false, 0xC000));
        assert_eq!(select_target(&root, 2), 0xA000);
    }

    #[test]
    fn no_detours_falls_through() {
        let root = DetourRoot::new(0, 0x1000, None);
        assert_eq!(select_target(&root, 7), 0x1000 + 2);
    }
}
