//! Agent-resident runtime state (spec §3): the applied-patch list and the
//! detour-root table every dispatch and apply/revert consults.

use ulp_common::PatchId;

/// A function pointer shape for a target library's exported
/// `__ulp_ret_local_universe`, or the default that always reports universe
/// zero for libraries that never shipped one (spec §4.4 step 4).
pub type LocalUniverseFn = extern "C" fn() -> u64;

extern "C" fn default_local_universe() -> u64 {
    0
}

/// One function replacement actually in effect (spec §3 `AppliedUnit`).
#[derive(Debug, Clone, Copy)]
pub struct AppliedUnit {
    pub patched_addr: u64,
    pub target_addr: u64,
    pub overwritten_bytes: [u8; 14],
}

/// A single apply operation's bookkeeping record.
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    pub patch_id: PatchId,
    pub units: Vec<AppliedUnit>,
    pub deps: Vec<PatchId>,
}

/// One (root × patch) detour (spec §3). Within a [`DetourRoot`], detours
/// are kept newest-first, i.e. strictly decreasing by `universe`.
#[derive(Debug, Clone, Copy)]
pub struct Detour {
    pub universe: u64,
    pub patch_id: PatchId,
    pub target_addr: u64,
    pub active: bool,
}

/// One patched call site (spec §3). `index` is the compact integer baked
/// into the call site's rewritten prologue.
pub struct DetourRoot {
    pub index: u64,
    pub patched_addr: u64,
    pub get_local_universe: LocalUniverseFn,
    /// Newest-first: `detours[0]` has the largest `universe`.
    pub detours: Vec<Detour>,
}

impl DetourRoot {
    pub fn new(index: u64, patched_addr: u64, get_local_universe: Option<LocalUniverseFn>) -> Self {
        DetourRoot {
            index,
            patched_addr,
            get_local_universe: get_local_universe.unwrap_or(default_local_universe),
            detours: Vec::new(),
        }
    }

    /// Inserts a new detour at the head, preserving invariant I1 (spec §8):
    /// callers must only call this with a `universe` strictly greater than
    /// every previously inserted one, which `global_universe`'s monotone
    /// counter guarantees.
    pub fn push_detour(&mut self, detour: Detour) {
        debug_assert!(self.detours.first().is_none_or(|d| d.universe < detour.universe));
        self.detours.insert(0, detour);
    }
}

/// Process-wide agent state (spec §3 "Global state"). Kept as plain `Vec`s
/// per the preserved open-question decision: the dispatcher's O(N) scan
/// over roots is cheap at the expected scale (a few hundred patched call
/// sites) and avoids adding a hasher to the no-heap-mutation-outside-a-
/// critical-section story.
pub struct AgentState {
    pub load_state: u8,
    pub global_universe: u64,
    pub applied: Vec<AppliedPatch>,
    pub roots: Vec<DetourRoot>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentState {
    pub const fn new() -> Self {
        AgentState {
            load_state: 0,
            global_universe: 0,
            applied: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn find_root(&self, patched_addr: u64) -> Option<&DetourRoot> {
        self.roots.iter().find(|r| r.patched_addr == patched_addr)
    }

    pub fn find_root_mut(&mut self, patched_addr: u64) -> Option<&mut DetourRoot> {
        self.roots.iter_mut().find(|r| r.patched_addr == patched_addr)
    }

    pub fn find_root_by_index(&self, index: u64) -> Option<&DetourRoot> {
        self.roots.iter().find(|r| r.index == index)
    }

    pub fn is_applied(&self, patch_id: &PatchId) -> bool {
        self.applied.iter().any(|p| p.patch_id == *patch_id)
    }

    pub fn depends_on(&self, patch_id: &PatchId) -> bool {
        self.applied
            .iter()
            .any(|p| p.deps.iter().any(|d| d == patch_id))
    }
}
