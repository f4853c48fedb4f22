pub mod store;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use burrow_types::Digest;

use crate::compress::CompressMode;
use crate::error::Result;

pub use store::AttribStore;

/// File name prefix of attribute containers: `attrib_<hex digest>`.
pub const ATTRIB_PREFIX: &str = "attrib_";

/// Entry type of a filesystem object recorded in a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FileType {
    #[default]
    File,
    Hardlink,
    Symlink,
    Chardev,
    Blockdev,
    Dir,
    Fifo,
    Socket,
    Unknown,
    /// Tombstone in an unfilled incremental: the entry existed in the base
    /// and is gone in this backup. Carries no digest.
    Deleted,
}

impl FileType {
    /// Types whose on-disk payload is content-addressed into the pool.
    pub fn has_content(self) -> bool {
        matches!(
            self,
            FileType::File
                | FileType::Hardlink
                | FileType::Symlink
                | FileType::Chardev
                | FileType::Blockdev
        )
    }
}

/// Per-entry attributes stored in a directory's container or in the
/// per-backup inode table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub name: String,
    pub ftype: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    /// Content address; `None` for directories and data-less entries.
    #[serde(default)]
    pub digest: Option<Digest>,
    /// Compression mode under which `digest` resolves in the pool.
    #[serde(default)]
    pub compress: CompressMode,
    /// Key into the per-backup inode table when `nlinks > 0`.
    #[serde(default)]
    pub inode: u64,
    /// 0 means no inode indirection; >0 means hard-link group member.
    #[serde(default)]
    pub nlinks: u32,
    /// Synthetic entry for a directory seen only by directory scan.
    #[serde(default)]
    pub no_attrib: bool,
}

impl AttributeRecord {
    /// Skeleton DIR entry for a directory present on disk but absent from
    /// its parent's container.
    pub fn synthetic_dir(name: &str) -> Self {
        AttributeRecord {
            name: name.to_string(),
            ftype: FileType::Dir,
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            digest: None,
            compress: CompressMode::None,
            inode: 0,
            nlinks: 0,
            no_attrib: true,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.ftype == FileType::Dir
    }
}

/// Ordered name → record map; the serialized form of one directory.
pub type Container = BTreeMap<String, AttributeRecord>;

/// Serialize a container to its canonical byte form. The container digest
/// is defined over exactly these bytes.
pub fn encode_container(container: &Container) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(container)?)
}

pub fn decode_container(bytes: &[u8]) -> Result<Container> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// File name of a container with the given digest.
pub fn attrib_file_name(digest: &Digest) -> String {
    format!("{ATTRIB_PREFIX}{}", digest.to_hex())
}

/// Parse the digest embedded in an `attrib_<hex>` file name.
pub fn parse_attrib_name(name: &str) -> Option<Digest> {
    Digest::from_hex(name.strip_prefix(ATTRIB_PREFIX)?)
}

/// All `attrib_*` files in a directory, with their embedded digests.
/// Missing directories yield an empty list.
pub fn attrib_files(dir: &Path) -> Result<Vec<(String, Digest)>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(digest) = parse_attrib_name(&name) {
            out.push((name, digest));
        }
    }
    out.sort();
    Ok(out)
}

/// The current container among transitional multiples: newest mtime wins,
/// name order breaks ties.
pub fn current_attrib(dir: &Path) -> Result<Option<(String, Digest)>> {
    let mut best: Option<(std::time::SystemTime, String, Digest)> = None;
    for (name, digest) in attrib_files(dir)? {
        let mtime = std::fs::metadata(dir.join(&name))
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let better = match &best {
            None => true,
            Some((t, n, _)) => mtime > *t || (mtime == *t && name > *n),
        };
        if better {
            best = Some((mtime, name, digest));
        }
    }
    Ok(best.map(|(_, name, digest)| (name, digest)))
}
