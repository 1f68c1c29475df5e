//! Low-level process I/O (spec §4.1, C1), grounded on the teacher's
//! `linux_ptrace_dumper.rs` attach/detach/getregs pattern and the original
//! `tools/ptrace.c` read-modify-write byte helpers.

use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::ProcessError;

/// Attaches to `tid` and blocks until the kernel reports it stopped.
pub fn attach(tid: i32) -> Result<(), ProcessError> {
    let pid = Pid::from_raw(tid);
    ptrace::attach(pid).map_err(|source| ProcessError::Attach { tid, source })?;
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(..)) => return Ok(()),
            Ok(WaitStatus::Exited(..)) => return Err(ProcessError::TargetExited { tid }),
            Ok(WaitStatus::Signaled(..)) => return Err(ProcessError::AbnormalStop { tid }),
            Ok(_) => continue,
            Err(nix::Error::EINTR) => continue,
            Err(source) => return Err(ProcessError::Wait { tid, source }),
        }
    }
}

/// Detaches from `tid`, resuming it.
pub fn detach(tid: i32) -> Result<(), ProcessError> {
    ptrace::detach(Pid::from_raw(tid), None).map_err(|source| ProcessError::Detach { tid, source })
}

pub fn get_regs(tid: i32) -> Result<libc::user_regs_struct, ProcessError> {
    ptrace::getregs(Pid::from_raw(tid)).map_err(|source| ProcessError::GetRegs { tid, source })
}

pub fn set_regs(tid: i32, regs: libc::user_regs_struct) -> Result<(), ProcessError> {
    ptrace::setregs(Pid::from_raw(tid), regs).map_err(|source| ProcessError::SetRegs { tid, source })
}

/// Reads one machine word at `addr` (spec §4.1: "one machine-word at a
/// time").
pub fn peek_word(tid: i32, addr: u64) -> Result<u64, ProcessError> {
    ptrace::read(Pid::from_raw(tid), addr as *mut std::ffi::c_void)
        .map(|w| w as u64)
        .map_err(|source| ProcessError::Read {
            tid,
            address: addr,
            length: std::mem::size_of::<usize>(),
            source,
        })
}

/// Writes one machine word at `addr`.
pub fn poke_word(tid: i32, addr: u64, word: u64) -> Result<(), ProcessError> {
    ptrace::write(Pid::from_raw(tid), addr as *mut std::ffi::c_void, word as i64).map_err(
        |source| ProcessError::Write {
            tid,
            address: addr,
            length: std::mem::size_of::<usize>(),
            source,
        },
    )
}

/// Byte-oriented read built on [`peek_word`] (spec §4.1).
pub fn read_memory(tid: i32, addr: u64, len: usize) -> Result<Vec<u8>, ProcessError> {
    let word_size = std::mem::size_of::<usize>() as u64;
    let mut out = Vec::with_capacity(len);
    let mut offset = 0u64;
    while (out.len() as u64) < len as u64 {
        let word = peek_word(tid, addr + offset)?;
        let bytes = word.to_ne_bytes();
        let take = (len as u64 - out.len() as u64).min(word_size) as usize;
        out.extend_from_slice(&bytes[..take]);
        offset += word_size;
    }
    Ok(out)
}

/// Byte-oriented write built on [`peek_word`]/[`poke_word`] (read-modify-
/// write, since the debug primitive only supports word-granular pokes —
/// spec §9 "Cross-process memory access").
pub fn write_bytes(tid: i32, addr: u64, data: &[u8]) -> Result<(), ProcessError> {
    let word_size = std::mem::size_of::<usize>() as u64;
    let mut offset = 0u64;
    while offset < data.len() as u64 {
        let word_addr = addr + offset;
        let take = ((data.len() as u64 - offset).min(word_size)) as usize;
        let mut word = peek_word(tid, word_addr)?.to_ne_bytes();
        word[..take].copy_from_slice(&data[offset as usize..offset as usize + take]);
        poke_word(tid, word_addr, u64::from_ne_bytes(word))?;
        offset += take as u64;
    }
    Ok(())
}

/// Writes a NUL-terminated string at `addr` (spec §4.1).
pub fn write_string(tid: i32, addr: u64, s: &str) -> Result<(), ProcessError> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    write_bytes(tid, addr, &bytes)
}

/// Resumes `tid` and blocks until it stops again, reporting how (spec
/// §4.1).
pub fn continue_until_stop(tid: i32) -> Result<(), ProcessError> {
    let pid = Pid::from_raw(tid);
    ptrace::cont(pid, None).map_err(|source| ProcessError::Cont { tid, source })?;
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(..)) => return Ok(()),
            Ok(WaitStatus::Exited(..)) => return Err(ProcessError::TargetExited { tid }),
            Ok(WaitStatus::Signaled(..)) => return Err(ProcessError::AbnormalStop { tid }),
            Ok(_) => continue,
            Err(nix::Error::EINTR) => continue,
            Err(source) => return Err(ProcessError::Wait { tid, source }),
        }
    }
}

// Exercising attach/read/write requires a live tracee (an actual child
// process under ptrace), which is integration-shaped (SPEC_FULL §10.5) and
// left to `tests/` alongside the hijack protocol rather than unit-tested
// here.
