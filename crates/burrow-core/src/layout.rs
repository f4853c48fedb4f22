use std::path::{Path, PathBuf};

use burrow_types::Digest;

use crate::compress::CompressMode;

/// Maps the logical entities of the store (hosts, backups, pool blobs) to
/// their locations under `TopDir`.
#[derive(Debug, Clone)]
pub struct Layout {
    top_dir: PathBuf,
}

impl Layout {
    pub fn new(top_dir: impl Into<PathBuf>) -> Self {
        Self {
            top_dir: top_dir.into(),
        }
    }

    pub fn top_dir(&self) -> &Path {
        &self.top_dir
    }

    /// `<TopDir>/pc` — root of all per-host trees.
    pub fn pc_dir(&self) -> PathBuf {
        self.top_dir.join("pc")
    }

    pub fn host_dir(&self, host: &str) -> PathBuf {
        self.pc_dir().join(host)
    }

    pub fn backup_dir(&self, host: &str, num: u32) -> PathBuf {
        self.host_dir(host).join(num.to_string())
    }

    /// Pool path of a blob: `<pool>/<xx>/<yy>/<hex>` with two shard levels
    /// taken from the leading digest bytes.
    pub fn pool_path(&self, mode: CompressMode, digest: &Digest) -> PathBuf {
        self.top_dir
            .join(mode.pool_name())
            .join(digest.shard_prefix())
            .join(digest.shard_suffix())
            .join(digest.to_hex())
    }

    /// Legacy pool path: single-nibble shard dirs, three levels deep.
    pub fn pool_path_v3(&self, mode: CompressMode, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        let mut path = self.top_dir.join(mode.pool_name());
        for nibble in hex.chars().take(3) {
            path.push(nibble.to_string());
        }
        path.join(hex)
    }

    /// The `_N` chain sibling of a legacy pool path. `seq == 0` is the bare
    /// path itself.
    pub fn pool_chain_v3(&self, mode: CompressMode, digest: &Digest, seq: u32) -> PathBuf {
        let base = self.pool_path_v3(mode, digest);
        if seq == 0 {
            base
        } else {
            let mut name = base.file_name().unwrap_or_default().to_os_string();
            name.push(format!("_{}", seq - 1));
            base.with_file_name(name)
        }
    }
}

/// Mangle one path element: prefix `f`, percent-escape `%`, `/`, control
/// bytes and everything outside printable ASCII. The result is pure ASCII,
/// so the encoding is byte-faithful and exactly reversible.
pub fn mangle_element(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    out.push('f');
    for b in name.bytes() {
        match b {
            b'%' | b'/' | 0x00..=0x1F | 0x80..=0xFF => {
                out.push('%');
                out.push_str(&format!("{b:02x}"));
            }
            _ => out.push(b as char),
        }
    }
    out
}

/// Reverse of [`mangle_element`]. Returns `None` for names that were never
/// mangled (no `f` prefix) or carry truncated escapes.
pub fn unmangle_element(name: &str) -> Option<String> {
    let rest = name.strip_prefix('f')?;
    let bytes = rest.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1)?;
            let lo = bytes.get(i + 2)?;
            let hex = std::str::from_utf8(&[*hi, *lo]).ok()?.to_string();
            out.push(u8::from_str_radix(&hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Mangle a share-relative path ("/a/b" or "a/b") into its on-disk form,
/// one element at a time.
pub fn mangle_path(rel: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        out.push(mangle_element(part));
    }
    out
}

/// True if a directory entry name is a payload entry (mangled), as opposed
/// to an attribute container or a bookkeeping directory.
pub fn is_mangled(name: &str) -> bool {
    name.starts_with('f')
}
