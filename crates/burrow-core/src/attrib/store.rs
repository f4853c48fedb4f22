use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, warn};

use burrow_types::Digest;

use crate::compress::{self, CompressMode};
use crate::error::Result;
use crate::layout::Layout;
use crate::refcnt::RefCountDelta;

use super::{
    attrib_file_name, current_attrib, decode_container, encode_container, AttributeRecord,
    Container,
};

/// Number of low inode bits folded into one shard container.
const INODE_SHARD_BITS: u32 = 14;

#[derive(Debug, Default)]
struct CachedDir {
    entries: Container,
    /// Digest embedded in the current on-disk file name, if one exists.
    on_disk: Option<Digest>,
    dirty: bool,
    /// Loaded through the zero-length legacy form; content lives in the pool.
    legacy: bool,
}

/// Write-back cache of attribute containers for one backup, covering both
/// the per-directory containers and the sharded inode table. All rewrites go
/// through the container rewrite protocol, feeding refcount deltas to the
/// injected journal.
pub struct AttribStore {
    backup_dir: PathBuf,
    compress: CompressMode,
    layout: Layout,
    cache: HashMap<PathBuf, CachedDir>,
    sink: Option<Rc<RefCell<RefCountDelta>>>,
    legacy_read_only: bool,
}

impl AttribStore {
    pub fn new(backup_dir: impl Into<PathBuf>, compress: CompressMode, layout: Layout) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            compress,
            layout,
            cache: HashMap::new(),
            sink: None,
            legacy_read_only: true,
        }
    }

    /// Wire in the journal that receives container rewrite deltas.
    pub fn set_delta_sink(&mut self, sink: Rc<RefCell<RefCountDelta>>) {
        self.sink = Some(sink);
    }

    /// When false, clean legacy containers are upgraded (inlined) at flush
    /// instead of waiting for the next mutation.
    pub fn set_legacy_read_only(&mut self, legacy_read_only: bool) {
        self.legacy_read_only = legacy_read_only;
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn compress(&self) -> CompressMode {
        self.compress
    }

    /// Load a directory's container into the cache and return a copy of its
    /// entries. A read error is returned once; the directory is then cached
    /// as empty so the rest of the tree can still be processed.
    pub fn load_dir(&mut self, rel: &Path) -> Result<Container> {
        if let Some(cached) = self.cache.get(rel) {
            return Ok(cached.entries.clone());
        }
        let dir = self.backup_dir.join(rel);
        let current = current_attrib(&dir)?;
        let mut cached = CachedDir::default();
        let mut read_err = None;
        if let Some((name, digest)) = current {
            cached.on_disk = Some(digest);
            match self.read_container_file(&dir.join(&name), &digest) {
                Ok((entries, legacy)) => {
                    cached.entries = entries;
                    cached.legacy = legacy;
                }
                Err(e) => {
                    warn!(path = %dir.join(&name).display(), error = %e,
                          "unreadable attribute container, treating as empty");
                    read_err = Some(e);
                }
            }
        }
        let entries = cached.entries.clone();
        self.cache.insert(rel.to_path_buf(), cached);
        match read_err {
            Some(e) => Err(e),
            None => Ok(entries),
        }
    }

    fn read_container_file(&self, path: &Path, digest: &Digest) -> Result<(Container, bool)> {
        let raw = fs::read(path)?;
        if raw.is_empty() {
            // Legacy form: the file name carries the digest, the serialized
            // bytes live in the pool.
            let blob = compress::read_file(&self.layout.pool_path(self.compress, digest))?;
            return Ok((decode_container(&blob)?, true));
        }
        Ok((decode_container(&raw)?, false))
    }

    /// Look up one entry by unmangled name.
    pub fn get(&mut self, rel: &Path, name: &str) -> Result<Option<AttributeRecord>> {
        let entries = self.load_dir(rel)?;
        Ok(entries.get(name).cloned())
    }

    pub fn set(&mut self, rel: &Path, rec: AttributeRecord) -> Result<()> {
        let _ = self.load_dir(rel);
        let cached = self.cache.get_mut(rel).expect("load_dir populated cache");
        cached.entries.insert(rec.name.clone(), rec);
        cached.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, rel: &Path, name: &str) -> Result<bool> {
        let _ = self.load_dir(rel);
        let cached = self.cache.get_mut(rel).expect("load_dir populated cache");
        let removed = cached.entries.remove(name).is_some();
        if removed {
            cached.dirty = true;
        }
        Ok(removed)
    }

    /// Drop a directory from the cache without flushing it. Used when the
    /// container file itself has been accounted and removed wholesale.
    pub fn forget_dir(&mut self, rel: &Path) {
        self.cache.remove(rel);
    }

    fn inode_dir(inode: u64) -> PathBuf {
        let shard = ((inode >> INODE_SHARD_BITS) & 0xff) as u8;
        PathBuf::from("inode").join(format!("{shard:02x}"))
    }

    pub fn get_inode(&mut self, inode: u64) -> Result<Option<AttributeRecord>> {
        self.get(&Self::inode_dir(inode), &inode.to_string())
    }

    pub fn set_inode(&mut self, inode: u64, mut rec: AttributeRecord) -> Result<()> {
        rec.name = inode.to_string();
        self.set(&Self::inode_dir(inode), rec)
    }

    pub fn delete_inode(&mut self, inode: u64) -> Result<bool> {
        self.remove(&Self::inode_dir(inode), &inode.to_string())
    }

    /// Serialize every dirty container back to disk via the rewrite
    /// protocol. With `force`, clean legacy containers are upgraded too.
    pub fn flush(&mut self, force: bool) -> Result<()> {
        let rels: Vec<PathBuf> = self.cache.keys().cloned().collect();
        for rel in rels {
            let cached = self.cache.get(&rel).expect("cache key");
            let upgrade = cached.legacy && (force || !self.legacy_read_only);
            if !cached.dirty && !upgrade {
                continue;
            }
            self.write_dir(&rel)?;
        }
        Ok(())
    }

    /// Rewrite one container: write `attrib_<d_new>`, journal the digest
    /// swap, unlink the old file. Writing an empty container means removing
    /// the file altogether. Unchanged content is a no-op (no deltas), except
    /// for legacy upgrades which rewrite the same digest in place.
    fn write_dir(&mut self, rel: &Path) -> Result<()> {
        let cached = self.cache.get(rel).expect("cache key");
        let dir = self.backup_dir.join(rel);
        let old = cached.on_disk;
        let legacy = cached.legacy;

        if cached.entries.is_empty() {
            if let Some(d_old) = old {
                self.emit(&d_old, -1);
                remove_quiet(&dir.join(attrib_file_name(&d_old)));
                debug!(dir = %dir.display(), "removed emptied attribute container");
            }
            let cached = self.cache.get_mut(rel).expect("cache key");
            cached.on_disk = None;
            cached.dirty = false;
            cached.legacy = false;
            return Ok(());
        }

        let bytes = encode_container(&cached.entries)?;
        let d_new = Digest::of(&bytes);
        if old == Some(d_new) && !legacy {
            let cached = self.cache.get_mut(rel).expect("cache key");
            cached.dirty = false;
            return Ok(());
        }

        fs::create_dir_all(&dir)?;
        fs::write(dir.join(attrib_file_name(&d_new)), &bytes)?;
        if old != Some(d_new) {
            self.emit(&d_new, 1);
            if let Some(d_old) = old {
                self.emit(&d_old, -1);
                remove_quiet(&dir.join(attrib_file_name(&d_old)));
            }
        }

        let cached = self.cache.get_mut(rel).expect("cache key");
        cached.on_disk = Some(d_new);
        cached.dirty = false;
        cached.legacy = false;
        Ok(())
    }

    fn emit(&self, digest: &Digest, delta: i64) {
        if let Some(sink) = &self.sink {
            sink.borrow_mut().update(self.compress, Some(digest), delta);
        }
    }
}

fn remove_quiet(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to unlink old container");
        }
    }
}
