use std::fs;
use std::path::Path;

use tracing::{error, warn};

use crate::attrib::{attrib_files, current_attrib, AttributeRecord, FileType};
use crate::delete::{self, BackupSide};
use crate::error::{BurrowError, Result};
use crate::layout;
use crate::progress::EngineStats;
use crate::walk;

/// Folds a backup being deleted into its immediate predecessor, an unfilled
/// incremental whose base is going away. Every attribute and inode
/// reference unique to the deleted side moves across, with a +1/−1 delta
/// pair so the merge is refcount-neutral over the pool.
pub(crate) struct MergeEngine<'a> {
    del: &'a mut BackupSide,
    mrg: &'a mut BackupSide,
    /// Fill state the merge target is about to adopt. A filled snapshot has
    /// no use for DELETED tombstones.
    filled_result: bool,
    stats: &'a mut EngineStats,
}

impl<'a> MergeEngine<'a> {
    pub(crate) fn new(
        del: &'a mut BackupSide,
        mrg: &'a mut BackupSide,
        del_no_fill: bool,
        stats: &'a mut EngineStats,
    ) -> Self {
        Self {
            del,
            mrg,
            filled_result: !del_no_fill,
            stats,
        }
    }

    /// Merge a single requested path: apply the fold rules to its entry in
    /// the parent container, then drop that entry from the deleted side.
    pub(crate) fn merge_top(&mut self, top: &Path) -> Result<()> {
        let parent = top.parent().unwrap_or(Path::new("")).to_path_buf();
        let mangled = top
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(name) = layout::unmangle_element(&mangled) else {
            return Err(BurrowError::Other(format!(
                "not a payload path: {}",
                top.display()
            )));
        };

        let mut a_del = match self.del.ac.get(&parent, &name) {
            Ok(rec) => rec,
            Err(_) => {
                self.stats.errors += 1;
                None
            }
        };
        if a_del.is_none() && self.del.dir.join(top).is_dir() {
            a_del = Some(AttributeRecord::synthetic_dir(&name));
        }
        let mut a_mrg = match self.mrg.ac.get(&parent, &name) {
            Ok(rec) => rec,
            Err(_) => {
                self.stats.errors += 1;
                None
            }
        };
        if a_mrg.is_none() && self.mrg.dir.join(top).is_dir() {
            a_mrg = Some(AttributeRecord::synthetic_dir(&name));
        }

        let Some(a_del) = a_del else {
            warn!(path = %top.display(), "nothing to merge at requested path");
            return Ok(());
        };

        self.process_name(&parent, &name, a_del, a_mrg)?;
        self.del.ac.remove(&parent, &name)?;
        Ok(())
    }

    /// The per-directory fold: union both containers (with synthetic DIR
    /// entries for on-disk children missing from them), resolve each name,
    /// then purge tombstones if the result is filled. The deleted side's
    /// container files are decremented here; the files themselves go when
    /// the tree is dissolved.
    pub(crate) fn merge_subtree(&mut self, rel: &Path) -> Result<()> {
        self.stats.dir_cnt += 1;
        let del_abs = self.del.dir.join(rel);
        let mrg_abs = self.mrg.dir.join(rel);

        let mut del_entries = match self.del.ac.load_dir(rel) {
            Ok(entries) => entries,
            Err(_) => {
                self.stats.errors += 1;
                Default::default()
            }
        };
        let mut mrg_entries = match self.mrg.ac.load_dir(rel) {
            Ok(entries) => entries,
            Err(_) => {
                self.stats.errors += 1;
                Default::default()
            }
        };

        for (_, digest) in attrib_files(&del_abs)? {
            self.del.emit(self.del.info.compress, Some(&digest), -1);
        }

        for sub in walk::subdirs(&del_abs)? {
            if !layout::is_mangled(&sub) {
                continue;
            }
            if let Some(name) = layout::unmangle_element(&sub) {
                del_entries
                    .entry(name.clone())
                    .or_insert_with(|| AttributeRecord::synthetic_dir(&name));
            }
        }
        for sub in walk::subdirs(&mrg_abs)? {
            if !layout::is_mangled(&sub) {
                continue;
            }
            if let Some(name) = layout::unmangle_element(&sub) {
                mrg_entries
                    .entry(name.clone())
                    .or_insert_with(|| AttributeRecord::synthetic_dir(&name));
            }
        }

        let names: Vec<String> = del_entries
            .keys()
            .chain(mrg_entries.keys())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        for name in names {
            let a_del = del_entries.get(&name).cloned();
            let a_mrg = mrg_entries.get(&name).cloned();
            let Some(a_del) = a_del else { continue };
            self.process_name(rel, &name, a_del, a_mrg)?;
        }

        if self.filled_result {
            let tombstones: Vec<String> = self
                .mrg
                .ac
                .load_dir(rel)?
                .iter()
                .filter(|(_, rec)| rec.ftype == FileType::Deleted)
                .map(|(name, _)| name.clone())
                .collect();
            for name in tombstones {
                self.mrg.ac.remove(rel, &name)?;
            }
        }

        self.del.ac.forget_dir(rel);
        Ok(())
    }

    fn process_name(
        &mut self,
        parent_rel: &Path,
        name: &str,
        a_del: AttributeRecord,
        a_mrg: Option<AttributeRecord>,
    ) -> Result<()> {
        let child_rel = parent_rel.join(layout::mangle_element(name));
        match a_mrg {
            Some(a_mrg) if a_mrg.is_dir() && a_del.is_dir() => {
                self.merge_subtree(&child_rel)?;
                if a_mrg.no_attrib && !a_del.no_attrib {
                    // The merge side only had a scan skeleton; take the real
                    // attributes from the deleted side.
                    self.mrg.ac.set(parent_rel, a_del)?;
                }
            }
            Some(a_mrg) => {
                // Type conflict or plain duplicate: the merge side wins and
                // the deleted side's copy is dropped.
                if a_del.is_dir() && !a_mrg.is_dir() {
                    if self.del.dir.join(&child_rel).is_dir() {
                        delete::delete_tree(self.del, self.stats, &child_rel, &[])?;
                    }
                } else {
                    if !a_del.is_dir() {
                        self.stats.file_cnt += 1;
                    }
                    self.del.emit(a_del.compress, a_del.digest.as_ref(), -1);
                    if a_del.nlinks > 0 {
                        delete::dec_inode(self.del, self.stats, a_del.inode);
                    }
                }
            }
            None => self.adopt(parent_rel, &child_rel, a_del)?,
        }
        Ok(())
    }

    /// An entry present only on the deleted side moves into the merge side:
    /// record copied, content reference transferred, inode reference
    /// transferred, and physical directories renamed across trees.
    fn adopt(&mut self, parent_rel: &Path, child_rel: &Path, rec: AttributeRecord) -> Result<()> {
        let is_dir = rec.is_dir();
        let digest = rec.digest;
        let compress = rec.compress;
        let nlinks = rec.nlinks;
        let inode = rec.inode;

        self.mrg.ac.set(parent_rel, rec)?;
        self.mrg.emit(compress, digest.as_ref(), 1);
        self.del.emit(compress, digest.as_ref(), -1);
        if !is_dir {
            self.stats.file_cnt += 1;
        }
        if nlinks > 0 {
            self.transfer_inode(inode);
        }

        if is_dir {
            let src = self.del.dir.join(child_rel);
            if src.is_dir() {
                let dst = self.mrg.dir.join(child_rel);
                fs::create_dir_all(self.mrg.dir.join(parent_rel))?;
                match fs::rename(&src, &dst) {
                    Ok(()) => self.copy_inodes(child_rel)?,
                    Err(e) => {
                        warn!(src = %src.display(), dst = %dst.display(), error = %e,
                              "rename into merge target failed, synthesizing");
                        self.stats.errors += 1;
                        if let Err(e) = fs::create_dir_all(&dst) {
                            warn!(dst = %dst.display(), error = %e, "cannot synthesize target");
                            self.stats.errors += 1;
                        }
                        delete::delete_tree(self.del, self.stats, child_rel, &[])?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Move one inode reference from the deleted side to the merge side.
    /// The merge side gets a copy of the inode entry on first contact; the
    /// deleted side's link count unwinds as in plain deletion.
    fn transfer_inode(&mut self, inode: u64) {
        let del_rec = match self.del.ac.get_inode(inode) {
            Ok(rec) => rec,
            Err(e) => {
                warn!(inode, error = %e, "cannot read inode table shard");
                self.stats.errors += 1;
                return;
            }
        };
        let Some(rec) = del_rec else {
            error!(inode, backup = %self.del.dir.display(),
                   "attribute references a missing inode");
            self.stats.errors += 1;
            return;
        };

        match self.mrg.ac.get_inode(inode) {
            Ok(Some(_)) => {}
            Ok(None) => {
                if self.mrg.ac.set_inode(inode, rec.clone()).is_ok() {
                    self.mrg.emit(rec.compress, rec.digest.as_ref(), 1);
                }
            }
            Err(e) => {
                warn!(inode, error = %e, "cannot read merge inode table shard");
                self.stats.errors += 1;
                return;
            }
        }

        if rec.nlinks <= 1 {
            self.del.emit(rec.compress, rec.digest.as_ref(), -1);
            let _ = self.del.ac.delete_inode(inode);
        } else {
            let mut updated = rec;
            updated.nlinks -= 1;
            let _ = self.del.ac.set_inode(inode, updated);
        }
    }

    /// After a successful directory rename, re-emit transfer deltas for
    /// everything inside the moved subtree: each record's content, each
    /// referenced inode, and the container files themselves, all of which
    /// changed owner without changing pool references.
    fn copy_inodes(&mut self, rel: &Path) -> Result<()> {
        self.stats.dir_cnt += 1;
        let abs = self.mrg.dir.join(rel);

        let current = current_attrib(&abs)?;
        for (fname, digest) in attrib_files(&abs)? {
            if current.as_ref().is_some_and(|(c, _)| *c == fname) {
                self.mrg.emit(self.mrg.info.compress, Some(&digest), 1);
                self.del.emit(self.del.info.compress, Some(&digest), -1);
            } else {
                // Stale container left behind by an interrupted rewrite.
                self.del.emit(self.del.info.compress, Some(&digest), -1);
                if let Err(e) = fs::remove_file(abs.join(&fname)) {
                    warn!(path = %abs.join(&fname).display(), error = %e,
                          "failed to unlink stale container");
                    self.stats.errors += 1;
                }
            }
        }

        let entries = match self.mrg.ac.load_dir(rel) {
            Ok(entries) => entries,
            Err(_) => {
                self.stats.errors += 1;
                Default::default()
            }
        };
        for rec in entries.values() {
            if !rec.is_dir() {
                self.stats.file_cnt += 1;
            }
            self.mrg.emit(rec.compress, rec.digest.as_ref(), 1);
            self.del.emit(rec.compress, rec.digest.as_ref(), -1);
            if rec.nlinks > 0 {
                self.transfer_inode(rec.inode);
            }
        }

        for sub in walk::subdirs(&abs)? {
            if layout::is_mangled(&sub) {
                self.copy_inodes(&rel.join(&sub))?;
            }
        }
        Ok(())
    }
}
