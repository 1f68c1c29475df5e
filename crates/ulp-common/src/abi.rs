//! x86-64 Linux ABI constants shared between the agent and the driver
//! (spec §4.6, §4.7, §6.2).

/// Length, in bytes, of the compiler-reserved NOP pad that precedes every
/// live-patchable function, *not counting* the function's own leading
/// 2-byte backward jump (which lives at the function's entry address,
/// immediately after the pad).
pub const PRE_NOPS_LEN: usize = 22;

/// Total length, in bytes, of the region the rewriter writes into and
/// therefore must hold writable+executable for the duration of the
/// rewrite: the NOP pad plus the function's own leading 2-byte jump.
/// Equal to [`PROLOGUE_TEMPLATE`]'s length.
pub const ULP_NOPS_LEN: usize = 24;

/// Offset within [`PROLOGUE_TEMPLATE`] of the 32-bit `DetourRoot` index
/// immediate.
pub const INDEX_FIELD_OFFSET: usize = 4;

/// Offset within [`PROLOGUE_TEMPLATE`] of the 8-byte absolute dispatcher
/// address.
pub const DISPATCHER_FIELD_OFFSET: usize = 14;

/// The fixed 24-byte prologue copied over a call site's NOP pad on apply
/// (spec §4.6 step 3):
///
/// ```text
/// 57                         push   %rdi
/// 48 c7 c7 00 00 00 00       mov    $0x0,%rdi        ; offset 4: index
/// ff 25 00 00 00 00         jmp    *0x0(%rip)        ; falls through to the
///                                                     ; absolute address below
/// 00 00 00 00 00 00 00 00   .quad  0                 ; offset 14: dispatcher addr
/// eb e8                     jmp    $-24              ; back to prologue_addr
/// ```
///
/// The final relative jump's displacement is fixed at `-(PRE_NOPS_LEN + 2)`
/// and never needs per-site patching: it always returns control to the
/// start of the padded region regardless of where that region sits in the
/// target's address space.
pub const PROLOGUE_TEMPLATE: [u8; ULP_NOPS_LEN] = [
    0x57, // push %rdi
    0x48, 0xc7, 0xc7, 0x00, 0x00, 0x00, 0x00, // mov $index,%rdi
    0xff, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp *0(%rip)
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // dispatcher address
    0xeb, (256 - (PRE_NOPS_LEN as isize + 2) as usize) as u8, // jmp back to prologue_addr
];

/// Number of bytes the kernel rewinds `rip` by when an attach interrupts an
/// in-flight syscall, so it gets re-executed on resume. Agent entry points
/// are padded by this many bytes; the driver biases its redirected `rip`
/// past them (spec §4.7 "Syscall-restart quirk").
pub const RESTART_SYSCALL_SIZE: u64 = 2;

/// SysV AMD64 ABI red zone size, honored when synthesizing a call frame
/// without kernel help (spec §4.7 step 4).
pub const RED_ZONE_LEN: u64 = 128;

/// Conservative stack alignment applied before redirecting a thread into
/// an agent routine (spec §4.7 step 4): `rsp &= !(STACK_ALIGN - 1)`.
pub const STACK_ALIGN: u64 = 64;

/// Marker substring used to heuristically classify a loaded object as a
/// livepatch object by filename (spec §4.2, §9 open question).
pub const LIVEPATCH_FILENAME_MARKER: &str = "_livepatch";

/// Name of the `.ulp` section's jump-slot entries: a `lea` whose
/// rip-relative displacement points at the real function entry
/// (spec §6.2).
pub const ULP_JUMP_SLOT_INSN_LEN: usize = 7;

/// Optional per-library export returning the calling thread's local
/// universe.
pub const LOCAL_UNIVERSE_SYMBOL: &str = "__ulp_ret_local_universe";

/// Sentinel symbols that, together, identify the agent object among a
/// process's loaded libraries (spec §4.2, §6.3).
pub const AGENT_SENTINEL_SYMBOLS: &[&str] = &[
    "__ulp_trigger",
    "__ulp_path_buffer",
    "__ulp_check_patched",
    "__ulp_state",
    "__ulp_get_global_universe",
    "__ulp_testlocks",
];

/// The symbol a live-patchable (but not yet patched) target library
/// exposes, distinguishing it from a generic loaded library.
pub const LOCAL_UNIVERSE_EXPORT: &str = LOCAL_UNIVERSE_SYMBOL;

/// Minimum capacity, in bytes, of the agent's path staging buffer
/// (spec §3, §6.3).
pub const PATH_BUFFER_LEN: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_jump_always_returns_to_pad_start() {
        // displacement interpreted as i8
        let disp = PROLOGUE_TEMPLATE[ULP_NOPS_LEN - 1] as i8;
        assert_eq!(disp as isize, -(PRE_NOPS_LEN as isize + 2));
    }

    #[test]
    fn template_length_covers_pad_plus_entry_jump() {
        assert_eq!(ULP_NOPS_LEN, PRE_NOPS_LEN + 2);
    }
}
