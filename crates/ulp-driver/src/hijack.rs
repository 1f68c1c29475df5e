//! Hijack protocol (spec §4.7, C7): stop every thread in the target,
//! redirect one into an agent routine, and restore everything afterward.
//! Grounded on the teacher's `suspend_thread`/`resume_thread` pair in
//! `linux_ptrace_dumper.rs`, extended to the full attach-all/run-and-
//! redirect/detach-all cycle the original `tools/main.c` drives.

use std::collections::HashMap;
use std::fs;

use ulp_common::abi::{RED_ZONE_LEN, RESTART_SYSCALL_SIZE, STACK_ALIGN};

use crate::error::ProcessError;
use crate::ptrace;

/// Lists every tid under `/proc/<pid>/task`, repeating the scan until a
/// full pass finds no new tids (spec §4.7 step 1: guards against threads
/// spawned while earlier threads are being attached).
fn enumerate_threads(pid: i32) -> Result<Vec<i32>, ProcessError> {
    let mut seen = std::collections::BTreeSet::new();
    loop {
        let task_dir = format!("/proc/{pid}/task");
        let entries = fs::read_dir(&task_dir).map_err(|_| ProcessError::TargetExited { tid: pid })?;
        let mut found_new = false;
        for entry in entries.flatten() {
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
                if seen.insert(tid) {
                    found_new = true;
                }
            }
        }
        if !found_new {
            break;
        }
    }
    Ok(seen.into_iter().collect())
}

/// An active critical section: every thread in the target is attached and
/// stopped until [`Hijack::end`] is called.
pub struct Hijack {
    pid: i32,
    main_tid: i32,
    saved_regs: HashMap<i32, libc::user_regs_struct>,
}

impl Hijack {
    /// Begins the critical section (spec §4.7 steps 1-3).
    pub fn begin(pid: i32) -> Result<Self, ProcessError> {
        let tids = enumerate_threads(pid)?;
        let mut saved_regs = HashMap::new();

        for &tid in &tids {
            if let Err(e) = ptrace::attach(tid) {
                for &done_tid in saved_regs.keys() {
                    if ptrace::detach(done_tid).is_err() {
                        return Err(ProcessError::RollbackFailed);
                    }
                }
                return Err(e);
            }
            match ptrace::get_regs(tid) {
                Ok(regs) => {
                    saved_regs.insert(tid, regs);
                }
                Err(e) => {
                    let _ = ptrace::detach(tid);
                    for &done_tid in saved_regs.keys() {
                        if ptrace::detach(done_tid).is_err() {
                            return Err(ProcessError::RollbackFailed);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let main_tid = if saved_regs.contains_key(&pid) {
            pid
        } else {
            *saved_regs.keys().next().ok_or(ProcessError::TargetExited { tid: pid })?
        };

        Ok(Hijack {
            pid,
            main_tid,
            saved_regs,
        })
    }

    /// Run-and-redirect (spec §4.7 step 4): synthesizes a call into the
    /// agent on the main thread and returns its return-register value.
    pub fn run_and_redirect(&self, routine_addr: u64) -> Result<u64, ProcessError> {
        let mut regs = *self
            .saved_regs
            .get(&self.main_tid)
            .expect("main thread always has saved registers after begin()");

        regs.rip = routine_addr + RESTART_SYSCALL_SIZE;
        regs.rsp = regs.rsp.wrapping_sub(RED_ZONE_LEN);
        regs.rsp &= !(STACK_ALIGN - 1);

        ptrace::set_regs(self.main_tid, regs)?;
        ptrace::continue_until_stop(self.main_tid)?;
        let result = ptrace::get_regs(self.main_tid)?;
        Ok(result.rax)
    }

    /// Spec §4.7 step 5: probes the agent's allocator/dynamic-linker
    /// locks before any allocator- or loader-reaching routine is called.
    /// Returns the raw `testlocks` contract value (0 safe, `EAGAIN` held,
    /// -1 fatal).
    pub fn testlocks(&self, testlocks_addr: u64) -> Result<i64, ProcessError> {
        self.run_and_redirect(testlocks_addr).map(|v| v as i64)
    }

    /// Ends the critical section (spec §4.7 step 6): restores the main
    /// thread's original registers and detaches every thread.
    pub fn end(self) -> Result<(), ProcessError> {
        if let Some(&main_regs) = self.saved_regs.get(&self.main_tid) {
            ptrace::set_regs(self.main_tid, main_regs)?;
        }
        let mut rollback_failed = false;
        for &tid in self.saved_regs.keys() {
            if ptrace::detach(tid).is_err() {
                rollback_failed = true;
            }
        }
        if rollback_failed {
            return Err(ProcessError::RollbackFailed);
        }
        Ok(())
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}
