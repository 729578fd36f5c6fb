//! Static-archive handling.
//!
//! An archive never loads wholesale. This module parses the container and
//! builds the name index (member -> globals it defines); the fixed-point
//! loop that pulls members against the undefined set lives with the link
//! pipeline, since each pulled member goes through the full module path.

use crate::{Result, error::archive_error};
use object::{Object, ObjectSymbol, read::archive::ArchiveFile};
use std::path::Path;

/// Archive magic per `ar(5)`.
pub(crate) fn is_archive(bytes: &[u8]) -> bool {
    bytes.starts_with(b"!<arch>\n")
}

pub(crate) struct MemberRecord {
    pub(crate) name: String,
    /// Member bytes copied out of the container: `ar(5)` only aligns
    /// members to 2 bytes, which is below what the ELF parser accepts
    /// for in-place reads.
    pub(crate) data: Vec<u8>,
    /// Global and weak definitions the member would contribute. Commons do
    /// not pull a member in, matching static-linker convention.
    pub(crate) defines: Vec<String>,
}

/// Parses the container and indexes every object member by the names it
/// defines. Non-object members are a format error; the index is built once
/// and reused through the whole pull loop.
pub(crate) fn parse_members(path: &Path, bytes: &[u8]) -> Result<Vec<MemberRecord>> {
    let archive = ArchiveFile::parse(bytes)
        .map_err(|e| archive_error(format!("{}: {e}", path.display())))?;
    let mut members = Vec::new();
    for member in archive.members() {
        let member = member.map_err(|e| archive_error(format!("{}: {e}", path.display())))?;
        let name = String::from_utf8_lossy(member.name()).into_owned();
        let data = member
            .data(bytes)
            .map_err(|e| archive_error(format!("{}({name}): {e}", path.display())))?
            .to_vec();
        let file = object::File::parse(data.as_slice())
            .map_err(|e| archive_error(format!("{}({name}): {e}", path.display())))?;
        let mut defines = Vec::new();
        for sym in file.symbols() {
            if sym.is_local() || sym.is_undefined() || sym.is_common() {
                continue;
            }
            if let Ok(n) = sym.name() {
                if !n.is_empty() {
                    defines.push(n.to_owned());
                }
            }
        }
        members.push(MemberRecord {
            name,
            data,
            defines,
        });
    }
    Ok(members)
}
