//! Reader for the on-disk patch metadata format (spec §6.1).
//!
//! Both the driver and the agent must decode identical bytes into an
//! identical [`PatchMetadata`]; this module is the single place that
//! understands the wire layout.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::MetadataError as Error;
use crate::model::{PatchId, PatchMetadata, PatchType, PatchUnit, PatchedObject, PATCH_ID_LEN};

fn read_u32<R: Read>(r: &mut R) -> Result<u32, Error> {
    r.read_u32::<LittleEndian>().map_err(Error::Io)
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, Error> {
    r.read_u64::<LittleEndian>().map_err(Error::Io)
}

fn read_bytes<R: Read>(r: &mut R, len: u32) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(Error::Io)?;
    Ok(buf)
}

/// Reads a length-prefixed byte string and decodes it as UTF-8.
///
/// The wire format never NUL-terminates these strings; the in-memory
/// `String` is implicitly NUL-terminatable (via `CString` conversion) by
/// whichever caller hands it to a loader API.
fn read_string<R: Read>(r: &mut R) -> Result<String, Error> {
    let len = read_u32(r)?;
    let bytes = read_bytes(r, len)?;
    String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
}

fn read_patch_id<R: Read>(r: &mut R) -> Result<PatchId, Error> {
    let mut buf = [0u8; PATCH_ID_LEN];
    r.read_exact(&mut buf).map_err(Error::Io)?;
    Ok(PatchId(buf))
}

/// Decodes a [`PatchMetadata`] from `r`, following spec §6.1 exactly.
///
/// The caller passes `full` = `true` to read through the name block even
/// for a revert (the driver's view, which always needs `so_filename`/
/// `build_id`/`obj_name` to identify what it's reverting from outside the
/// process) or `false` to stop right after the type tag for a revert (the
/// agent's view, matching the original parser's early return on
/// `type == 2`).
pub fn decode<R: Read>(r: &mut R, full: bool) -> Result<PatchMetadata, Error> {
    let mut type_byte = [0u8; 1];
    r.read_exact(&mut type_byte).map_err(Error::Io)?;
    let kind = PatchType::from_byte(type_byte[0]).ok_or(Error::UnknownType(type_byte[0]))?;
    let patch_id = read_patch_id(r)?;

    if kind == PatchType::Revert && !full {
        return Ok(PatchMetadata::revert(patch_id));
    }

    let so_filename = read_string(r)?;
    let build_id_len = read_u32(r)?;
    let build_id = read_bytes(r, build_id_len)?;
    let obj_name = read_string(r)?;

    if kind == PatchType::Revert {
        return Ok(PatchMetadata {
            kind,
            patch_id,
            so_filename: Some(so_filename),
            target: Some(PatchedObject {
                build_id,
                name: obj_name,
                units: Vec::new(),
            }),
            deps: Vec::new(),
        });
    }

    let nunits = read_u32(r)?;
    let mut units = Vec::with_capacity(nunits as usize);
    for _ in 0..nunits {
        let old_fname = read_string(r)?;
        let new_fname = read_string(r)?;
        let old_faddr = read_u64(r)?;
        units.push(PatchUnit {
            old_fname,
            new_fname,
            old_faddr,
        });
    }

    let ndeps = read_u32(r)?;
    let mut deps = Vec::with_capacity(ndeps as usize);
    for _ in 0..ndeps {
        deps.push(read_patch_id(r)?);
    }

    Ok(PatchMetadata {
        kind,
        patch_id,
        so_filename: Some(so_filename),
        target: Some(PatchedObject {
            build_id,
            name: obj_name,
            units,
        }),
        deps,
    })
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.write_u32::<LittleEndian>(v).expect("Vec<u8> writes never fail");
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.write_u64::<LittleEndian>(v).expect("Vec<u8> writes never fail");
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// Encodes `meta` per spec §6.1. Used by tooling that authors patch
/// metadata files and by the round-trip tests in this module.
pub fn encode(meta: &PatchMetadata) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(meta.kind as u8);
    out.extend_from_slice(&meta.patch_id.0);

    if meta.kind == PatchType::Revert && meta.target.is_none() {
        return out;
    }

    let target = meta.target.as_ref().expect("apply/full-revert metadata must carry a target");
    write_string(&mut out, meta.so_filename.as_deref().unwrap_or(""));
    write_u32(&mut out, target.build_id.len() as u32);
    out.extend_from_slice(&target.build_id);
    write_string(&mut out, &target.name);

    if meta.kind == PatchType::Revert {
        return out;
    }

    write_u32(&mut out, target.units.len() as u32);
    for unit in &target.units {
        write_string(&mut out, &unit.old_fname);
        write_string(&mut out, &unit.new_fname);
        write_u64(&mut out, unit.old_faddr);
    }

    write_u32(&mut out, meta.deps.len() as u32);
    for dep in &meta.deps {
        out.extend_from_slice(&dep.0);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_apply() -> PatchMetadata {
        PatchMetadata {
            kind: PatchType::Apply,
            patch_id: PatchId([1u8; PATCH_ID_LEN]),
            so_filename: Some("/tmp/foo_livepatch1.so".into()),
            target: Some(PatchedObject {
                build_id: vec![0xde, 0xad, 0xbe, 0xef],
                name: "/usr/lib/libfoo.so.1".into(),
                units: vec![PatchUnit {
                    old_fname: "do_work".into(),
                    new_fname: "do_work_fixed".into(),
                    old_faddr: 0x4010,
                }],
            }),
            deps: vec![PatchId([2u8; PATCH_ID_LEN])],
        }
    }

    #[test]
    fn apply_round_trip() {
        let original = sample_apply();
        let bytes = encode(&original);
        let decoded = decode(&mut Cursor::new(bytes), true).unwrap();
        assert_eq!(decoded.kind, original.kind);
        assert_eq!(decoded.patch_id, original.patch_id);
        assert_eq!(decoded.so_filename, original.so_filename);
        let target = decoded.target.unwrap();
        let orig_target = original.target.unwrap();
        assert_eq!(target.build_id, orig_target.build_id);
        assert_eq!(target.name, orig_target.name);
        assert_eq!(target.units.len(), orig_target.units.len());
        assert_eq!(target.units[0].old_fname, orig_target.units[0].old_fname);
        assert_eq!(decoded.deps, original.deps);
    }

    #[test]
    fn agent_revert_decode_stops_after_id() {
        let meta = PatchMetadata::revert(PatchId([7u8; PATCH_ID_LEN]));
        let bytes = encode(&meta);
        // Only type + id were written.
        assert_eq!(bytes.len(), 1 + PATCH_ID_LEN);
        let decoded = decode(&mut Cursor::new(bytes), false).unwrap();
        assert_eq!(decoded.patch_id, meta.patch_id);
        assert!(decoded.target.is_none());
    }

    #[test]
    fn truncated_metadata_is_an_error() {
        let bytes = vec![1u8, 0, 0]; // type=apply, then a too-short id
        let err = decode(&mut Cursor::new(bytes), true).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let bytes = vec![9u8; 1 + PATCH_ID_LEN];
        let err = decode(&mut Cursor::new(bytes), true).unwrap_err();
        assert!(matches!(err, Error::UnknownType(9)));
    }
}
