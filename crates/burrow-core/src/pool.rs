use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use tracing::debug;

use burrow_types::Digest;

use crate::compress::{self, CompressMode};
use crate::error::Result;
use crate::layout::Layout;

/// Outcome of streaming one blob into the pool.
#[derive(Debug)]
pub struct PoolWriteResult {
    /// True if the blob was already present (dedup hit).
    pub existed: bool,
    pub digest: Digest,
    /// Bytes occupied in the pool (encoded size; 0 on dedup hit).
    pub pool_size: u64,
    pub errors: u64,
}

/// Store uncompressed content into the pool under its content address, or
/// dedup against an existing blob. The blob is written next to its final
/// location and renamed into place so readers never observe a partial file.
pub fn pool_write(layout: &Layout, mode: CompressMode, data: &[u8]) -> Result<PoolWriteResult> {
    let digest = Digest::of(data);
    let path = layout.pool_path(mode, &digest);
    if path.exists() {
        return Ok(PoolWriteResult {
            existed: true,
            digest,
            pool_size: 0,
            errors: 0,
        });
    }

    let encoded = compress::encode(mode, data)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("new.{}", std::process::id()));
    fs::write(&tmp, &encoded)?;
    fs::rename(&tmp, &path)?;
    debug!(digest = %digest, size = encoded.len(), "stored pool blob");
    Ok(PoolWriteResult {
        existed: false,
        digest,
        pool_size: encoded.len() as u64,
        errors: 0,
    })
}

/// Scan the legacy pool chain (`<path3>`, `<path3>_0`, `<path3>_1`, …) for
/// an entry hard-linked to the given physical inode. The chain ends at the
/// first missing link.
pub fn v3_chain_find(
    layout: &Layout,
    mode: CompressMode,
    v3_digest: &Digest,
    ino: u64,
) -> Result<Option<PathBuf>> {
    for seq in 0.. {
        let path = layout.pool_chain_v3(mode, v3_digest, seq);
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.ino() == ino {
            return Ok(Some(path));
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_write_stores_then_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());

        let first = pool_write(&layout, CompressMode::Zstd, b"pool payload").unwrap();
        assert!(!first.existed);
        assert!(first.pool_size > 0);
        let path = layout.pool_path(CompressMode::Zstd, &first.digest);
        assert_eq!(compress::read_file(&path).unwrap(), b"pool payload");

        let second = pool_write(&layout, CompressMode::Zstd, b"pool payload").unwrap();
        assert!(second.existed);
        assert_eq!(second.digest, first.digest);
        assert_eq!(second.pool_size, 0);
    }

    #[test]
    fn chain_find_matches_inode() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let d = Digest::of(b"legacy");

        let p0 = layout.pool_chain_v3(CompressMode::None, &d, 0);
        let p1 = layout.pool_chain_v3(CompressMode::None, &d, 1);
        fs::create_dir_all(p0.parent().unwrap()).unwrap();
        fs::write(&p0, b"a").unwrap();
        fs::write(&p1, b"b").unwrap();

        let want = fs::metadata(&p1).unwrap().ino();
        assert_eq!(
            v3_chain_find(&layout, CompressMode::None, &d, want).unwrap(),
            Some(p1)
        );
        assert_eq!(
            v3_chain_find(&layout, CompressMode::None, &d, u64::MAX).unwrap(),
            None
        );
    }
}
