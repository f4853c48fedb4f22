use std::path::{Path, PathBuf};

use burrow_types::Digest;

use crate::attrib::{AttribStore, AttributeRecord, FileType};
use crate::backups::BackupInfo;
use crate::compress::CompressMode;
use crate::layout::{self, Layout};

/// Builds a V4 backup tree on disk: physical directories, attribute
/// containers and inode-table entries. The store is used without a delta
/// sink so fixture construction never journals anything; tests then assert
/// on exactly what the engine under test emits.
pub struct FixtureBackup {
    pub info: BackupInfo,
    pub dir: PathBuf,
    ac: AttribStore,
}

impl FixtureBackup {
    pub fn create(layout: &Layout, host: &str, info: BackupInfo) -> Self {
        let dir = layout.backup_dir(host, info.num);
        std::fs::create_dir_all(&dir).unwrap();
        let ac = AttribStore::new(&dir, info.compress, layout.clone());
        FixtureBackup { info, dir, ac }
    }

    fn rel_of(components: &[&str]) -> PathBuf {
        let mut rel = PathBuf::new();
        for part in components {
            rel.push(layout::mangle_element(part));
        }
        rel
    }

    /// Add a directory (the last component) under the given path, recording
    /// it in its parent's container and creating the physical directory.
    /// `components[0]` is the share name.
    pub fn put_dir(&mut self, components: &[&str]) {
        let (name, parents) = components.split_last().unwrap();
        let parent_rel = Self::rel_of(parents);
        let mut rec = AttributeRecord::synthetic_dir(name);
        rec.no_attrib = false;
        rec.compress = self.info.compress;
        self.ac.set(&parent_rel, rec).unwrap();
        std::fs::create_dir_all(self.dir.join(Self::rel_of(components))).unwrap();
    }

    /// Add a regular-file record. Content is only hashed, never pooled:
    /// none of the engines under test read payload blobs back.
    pub fn put_file(&mut self, dir_components: &[&str], name: &str, content: &[u8]) -> Digest {
        let digest = Digest::of(content);
        let rec = AttributeRecord {
            name: name.to_string(),
            ftype: FileType::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: content.len() as u64,
            mtime: 1_700_000_000,
            digest: Some(digest),
            compress: self.info.compress,
            inode: 0,
            nlinks: 0,
            no_attrib: false,
        };
        self.ac.set(&Self::rel_of(dir_components), rec).unwrap();
        digest
    }

    /// Add a DELETED tombstone entry.
    pub fn put_deleted(&mut self, dir_components: &[&str], name: &str) {
        let rec = AttributeRecord {
            name: name.to_string(),
            ftype: FileType::Deleted,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            digest: None,
            compress: self.info.compress,
            inode: 0,
            nlinks: 0,
            no_attrib: false,
        };
        self.ac.set(&Self::rel_of(dir_components), rec).unwrap();
    }

    /// Add a hard-link member: a path record pointing at an inode (no
    /// digest of its own), and the inode entry holding the content digest
    /// and the full link count. Call once per path with the same `inode`
    /// and `nlinks_total`.
    pub fn put_hardlink(
        &mut self,
        dir_components: &[&str],
        name: &str,
        inode: u64,
        nlinks_total: u32,
        content: &[u8],
    ) -> Digest {
        let digest = Digest::of(content);
        let rec = AttributeRecord {
            name: name.to_string(),
            ftype: FileType::Hardlink,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: content.len() as u64,
            mtime: 1_700_000_000,
            digest: None,
            compress: self.info.compress,
            inode,
            nlinks: nlinks_total,
            no_attrib: false,
        };
        self.ac.set(&Self::rel_of(dir_components), rec).unwrap();

        let ino_rec = AttributeRecord {
            name: inode.to_string(),
            ftype: FileType::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: content.len() as u64,
            mtime: 1_700_000_000,
            digest: Some(digest),
            compress: self.info.compress,
            inode,
            nlinks: nlinks_total,
            no_attrib: false,
        };
        self.ac.set_inode(inode, ino_rec).unwrap();
        digest
    }

    /// Write all containers out. Returns the finished tree root.
    pub fn finish(mut self) -> PathBuf {
        self.ac.flush(true).unwrap();
        self.dir
    }
}

/// Digests of every attribute container file under a backup tree,
/// `refCnt/` excluded. Captured before a run to assert container
/// accounting afterwards.
pub fn container_digests(backup_dir: &Path) -> Vec<Digest> {
    let mut out = Vec::new();
    collect_containers(backup_dir, &mut out, true);
    out
}

fn collect_containers(dir: &Path, out: &mut Vec<Digest>, top: bool) {
    for (_, digest) in crate::attrib::attrib_files(dir).unwrap() {
        out.push(digest);
    }
    for sub in crate::walk::subdirs(dir).unwrap() {
        if top && sub == crate::refcnt::REFCNT_DIR {
            continue;
        }
        collect_containers(&dir.join(&sub), out, false);
    }
}

/// Journal total for one digest under the backup's compress mode.
pub fn journal_delta(backup_dir: &Path, compress: CompressMode, digest: &Digest) -> i64 {
    crate::refcnt::read_journal(backup_dir)
        .unwrap()
        .get(&(compress, *digest))
        .copied()
        .unwrap_or(0)
}
