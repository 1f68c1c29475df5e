//! Driver CLI (spec §6.4): pid plus a metadata file path, exit code
//! encoding the failure class (§7). Kept as a thin argument-parsing shim
//! over the library-shaped modules, matching the teacher's own
//! `bin/test.rs` plus `write_minidump` free-function split.

use std::env;
use std::fs::File;
use std::io::BufReader;

use ulp_common::{codec, PatchId, PATCH_ID_LEN};

mod auxv;
mod error;
mod hijack;
mod inspect;
mod mem;
mod patch;
mod ptrace;

use error::PatchError;

fn parse_patch_id(hex: &str) -> Option<PatchId> {
    if hex.len() != PATCH_ID_LEN * 2 {
        return None;
    }
    let mut bytes = [0u8; PATCH_ID_LEN];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(PatchId(bytes))
}

fn run(args: &[String]) -> Result<(), PatchError> {
    match args {
        [cmd, pid, id_hex] if cmd == "is-applied" => {
            let pid: i32 = pid
                .parse()
                .map_err(|_| PatchError::LoadFailed(format!("invalid pid: {pid}")))?;
            let patch_id = parse_patch_id(id_hex)
                .ok_or_else(|| PatchError::LoadFailed(format!("invalid patch id: {id_hex}")))?;
            let applied = patch::is_applied(pid, patch_id)?;
            println!("{applied}");
            Ok(())
        }
        [cmd, pid] if cmd == "global-universe" || cmd == "local-universe" => {
            let pid: i32 = pid
                .parse()
                .map_err(|_| PatchError::LoadFailed(format!("invalid pid: {pid}")))?;
            let universe = if cmd == "global-universe" {
                patch::global_universe(pid)?
            } else {
                patch::local_universe(pid)?
            };
            println!("{universe}");
            Ok(())
        }
        [pid, metadata_path] => {
            let pid: i32 = pid
                .parse()
                .map_err(|_| PatchError::LoadFailed(format!("invalid pid: {pid}")))?;
            let file = File::open(metadata_path)
                .map_err(|e| PatchError::LoadFailed(format!("{metadata_path}: {e}")))?;
            let meta = codec::decode(&mut BufReader::new(file), true)?;
            match meta.kind {
                ulp_common::PatchType::Apply => patch::apply(pid, &meta),
                ulp_common::PatchType::Revert => patch::revert(pid, meta.patch_id),
            }
        }
        _ => Err(PatchError::LoadFailed(
            "usage: ulp-driver <pid> <metadata-path> | ulp-driver is-applied <pid> <patch-id-hex> \
             | ulp-driver global-universe <pid> | ulp-driver local-universe <pid>"
                .into(),
        )),
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        log::error!("{e}");
        std::process::exit(e.exit_code());
    }
}
