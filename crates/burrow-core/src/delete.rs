use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{error, info, warn};

use crate::attrib::{attrib_files, AttribStore, AttributeRecord};
use crate::backups::{BackupInfo, BackupList};
use crate::compress::CompressMode;
use crate::config::BurrowConfig;
use crate::error::{BurrowError, Result};
use crate::layout::{self, Layout};
use crate::merge::MergeEngine;
use crate::progress::{EngineStats, Progress};
use crate::refcnt::{self, RefCountDelta, REFCNT_DIR};
use crate::sentinel::Sentinel;
use crate::server::ServerClient;
use crate::walk;

/// One backup being mutated: its metadata, tree root, attribute store and
/// delta journal, the store feeding the journal.
pub(crate) struct BackupSide {
    pub info: BackupInfo,
    pub dir: PathBuf,
    pub ac: AttribStore,
    pub drc: Rc<RefCell<RefCountDelta>>,
}

impl BackupSide {
    pub(crate) fn open(layout: &Layout, host: &str, info: BackupInfo) -> Self {
        let dir = layout.backup_dir(host, info.num);
        Self::at(dir, info, layout.clone())
    }

    /// Open a side rooted at an explicit directory (a migration destination
    /// before the commit swap).
    pub(crate) fn at(dir: PathBuf, info: BackupInfo, layout: Layout) -> Self {
        let drc = Rc::new(RefCell::new(RefCountDelta::new(&dir)));
        let mut ac = AttribStore::new(&dir, info.compress, layout);
        ac.set_delta_sink(Rc::clone(&drc));
        BackupSide { info, dir, ac, drc }
    }

    pub(crate) fn emit(&self, compress: CompressMode, digest: Option<&burrow_types::Digest>, delta: i64) {
        self.drc.borrow_mut().update(compress, digest, delta);
    }
}

pub struct DeleteRequest {
    pub host: String,
    pub num: u32,
    /// Override a `keep` mark on the backup.
    pub force: bool,
    /// Retain `XferLOG`/`SmbLOG` files on whole-backup delete.
    pub keep_logs: bool,
    /// Skip the server-held host mutex.
    pub skip_mutex: bool,
    /// Force a refcount reconciliation pass at the end even for a
    /// share-scoped delete.
    pub refcount_update: bool,
    /// Scope the delete to one share; empty `paths` deletes the whole share.
    pub share: Option<String>,
    pub paths: Vec<String>,
}

#[derive(Debug)]
pub struct DeleteStats {
    pub file_cnt: u64,
    pub dir_cnt: u64,
    pub errors: u64,
    /// True when the backup was folded into its predecessor first.
    pub merged: bool,
}

/// Delete a backup, or paths within it, maintaining pool refcount deltas.
/// When the immediate predecessor is an unfilled incremental based on the
/// target, the target is merged into it first so the predecessor stays
/// meaningful.
pub fn run(config: &BurrowConfig, req: &DeleteRequest, progress: &mut Progress) -> Result<DeleteStats> {
    let layout = Layout::new(&config.top_dir);
    let host_dir = layout.host_dir(&req.host);
    let mut list = BackupList::load(&host_dir)?;

    let target = list
        .find(req.num)
        .cloned()
        .ok_or_else(|| BurrowError::BackupNotFound {
            host: req.host.clone(),
            num: req.num,
        })?;

    if target.keep && !req.force {
        return Err(BurrowError::KeepSet(req.num));
    }

    let _mutex = if req.skip_mutex {
        None
    } else {
        Some(ServerClient::from_config(config).lock_host(&req.host)?)
    };

    let share_scoped = req.share.is_some();

    // Pre-V4 backups carry no refcounts: tree removal only.
    if !target.is_v4() {
        if share_scoped {
            return Err(BurrowError::Other(
                "share-scoped delete requires a V4 backup".into(),
            ));
        }
        return delete_legacy(config, req, &mut list, &target, progress);
    }

    let candidate = list
        .merge_candidate(req.num)
        .filter(|c| c.is_v4() && c.no_fill)
        .cloned();
    let merging = candidate.is_some();

    let mut del = BackupSide::open(&layout, &req.host, target.clone());

    // Sentinels bracket every mutation that leaves the tree in place.
    if share_scoped || merging {
        Sentinel::Delete.create(&del.dir)?;
    }
    let mut mrg = match &candidate {
        Some(c) => {
            let side = BackupSide::open(&layout, &req.host, c.clone());
            Sentinel::Delete.create(&side.dir)?;
            if c.compress != target.compress {
                return Err(BurrowError::CannotMerge(format!(
                    "backup #{} and #{} use different compression modes",
                    target.num, c.num
                )));
            }
            Some(side)
        }
        None => None,
    };

    let mut stats = EngineStats::default();
    progress.state("delete");

    if share_scoped {
        let share = req.share.as_deref().unwrap_or_default();
        let tops: Vec<PathBuf> = if req.paths.is_empty() {
            vec![PathBuf::from(layout::mangle_element(share))]
        } else {
            req.paths
                .iter()
                .map(|p| PathBuf::from(layout::mangle_element(share)).join(layout::mangle_path(p)))
                .collect()
        };
        for top in &tops {
            match &mut mrg {
                Some(mrg) => {
                    MergeEngine::new(&mut del, mrg, target.no_fill, &mut stats)
                        .merge_top(top)?;
                    let leftover = del.dir.join(top);
                    if leftover.exists() {
                        stats.errors += walk::rmtree_quiet(&leftover);
                    }
                }
                None => delete_path(&mut del, &mut stats, top)?,
            }
            progress.file_count(&stats);
        }

        del.ac.flush(false)?;
        if let Some(mrg) = &mut mrg {
            mrg.ac.flush(false)?;
            mrg.drc.borrow_mut().flush()?;
        }
        del.drc.borrow_mut().flush()?;

        if req.refcount_update {
            refcnt::request_reconcile(config, &req.host);
        }
        Sentinel::Delete.clear_on_success(&del.dir, stats.errors, config.ref_cnt_fsck);
        if let Some(mrg) = &mrg {
            Sentinel::Delete.clear_on_success(&mrg.dir, stats.errors, config.ref_cnt_fsck);
        }
        progress.file_count(&stats);
        return Ok(DeleteStats {
            file_cnt: stats.file_cnt,
            dir_cnt: stats.dir_cnt,
            errors: stats.errors,
            merged: merging,
        });
    }

    // Whole-backup delete.
    match &mut mrg {
        Some(mrg) => {
            MergeEngine::new(&mut del, mrg, target.no_fill, &mut stats)
                .merge_subtree(Path::new(""))?;
        }
        None => {
            delete_tree(&mut del, &mut stats, Path::new(""), &["inode", REFCNT_DIR])?;
        }
    }
    progress.file_count(&stats);

    // The inode table dissolves with the tree: its container files get an
    // explicit decrement, matching the per-record decrements emitted as
    // references hit zero. The in-cache decremented state is discarded.
    sweep_inode_containers(&mut del, &mut stats)?;

    if let Some(mrg) = &mut mrg {
        mrg.ac.flush(false)?;
        mrg.drc.borrow_mut().flush()?;
    }
    del.drc.borrow_mut().flush()?;

    // Drop everything but refCnt/, which carries the journal (and any
    // sentinel) until the reconciler has consumed it.
    for entry in walk::dir_entries(&del.dir)? {
        if entry.name == REFCNT_DIR {
            continue;
        }
        let path = del.dir.join(&entry.name);
        if entry.is_dir {
            stats.errors += walk::rmtree_quiet(&path);
        } else if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove file");
            stats.errors += 1;
        }
    }

    if !req.keep_logs {
        remove_backup_logs(&host_dir, req.num, &mut stats);
    }

    list.remove(req.num);
    if let Some(mrg_side) = &mrg {
        if let Some(entry) = list.find_mut(mrg_side.info.num) {
            // The predecessor takes over the deleted backup's role.
            entry.no_fill = target.no_fill;
        }
    }
    list.save()?;

    refcnt::request_reconcile(config, &req.host);
    Sentinel::Delete.clear_on_success(&del.dir, stats.errors, config.ref_cnt_fsck);
    if let Some(mrg) = &mrg {
        Sentinel::Delete.clear_on_success(&mrg.dir, stats.errors, config.ref_cnt_fsck);
    }

    info!(host = %req.host, num = req.num, merged = merging,
          files = stats.file_cnt, errors = stats.errors, "backup deleted");
    progress.file_count(&stats);
    Ok(DeleteStats {
        file_cnt: stats.file_cnt,
        dir_cnt: stats.dir_cnt,
        errors: stats.errors,
        merged: merging,
    })
}

fn delete_legacy(
    config: &BurrowConfig,
    req: &DeleteRequest,
    list: &mut BackupList,
    target: &BackupInfo,
    progress: &mut Progress,
) -> Result<DeleteStats> {
    let layout = Layout::new(&config.top_dir);
    let dir = layout.backup_dir(&req.host, req.num);
    progress.state("delete");
    let mut stats = EngineStats::default();
    stats.errors += walk::rmtree_quiet(&dir);
    if !req.keep_logs {
        remove_backup_logs(&layout.host_dir(&req.host), req.num, &mut stats);
    }
    list.remove(target.num);
    list.save()?;
    info!(host = %req.host, num = req.num, "legacy backup deleted");
    Ok(DeleteStats {
        file_cnt: stats.file_cnt,
        dir_cnt: stats.dir_cnt,
        errors: stats.errors,
        merged: false,
    })
}

/// Emit the decrement for one record's content and unwind its inode
/// reference. Directories carry no digest and no inode.
pub(crate) fn drop_record(side: &mut BackupSide, stats: &mut EngineStats, rec: &AttributeRecord) {
    if !rec.is_dir() {
        stats.file_cnt += 1;
    }
    side.emit(rec.compress, rec.digest.as_ref(), -1);
    if rec.nlinks > 0 {
        dec_inode(side, stats, rec.inode);
    }
}

/// Decrement an inode's remaining link count; at zero the inode entry and
/// its content reference go away.
pub(crate) fn dec_inode(side: &mut BackupSide, stats: &mut EngineStats, inode: u64) {
    match side.ac.get_inode(inode) {
        Ok(Some(mut rec)) => {
            if rec.nlinks <= 1 {
                side.emit(rec.compress, rec.digest.as_ref(), -1);
                let _ = side.ac.delete_inode(inode);
            } else {
                rec.nlinks -= 1;
                let _ = side.ac.set_inode(inode, rec);
            }
        }
        Ok(None) => {
            error!(inode, backup = %side.dir.display(),
                   "attribute references a missing inode");
            stats.errors += 1;
        }
        Err(e) => {
            warn!(inode, error = %e, "cannot read inode table shard");
            stats.errors += 1;
        }
    }
}

/// Remove one requested path: drop its record from the parent container,
/// then dissolve any on-disk subtree under it.
pub(crate) fn delete_path(side: &mut BackupSide, stats: &mut EngineStats, rel: &Path) -> Result<()> {
    let parent = rel.parent().unwrap_or(Path::new("")).to_path_buf();
    let mangled = rel
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let Some(name) = layout::unmangle_element(&mangled) else {
        return Err(BurrowError::Other(format!(
            "not a payload path: {}",
            rel.display()
        )));
    };

    match side.ac.get(&parent, &name) {
        Ok(Some(rec)) => {
            drop_record(side, stats, &rec);
            side.ac.remove(&parent, &name)?;
        }
        Ok(None) => {
            warn!(path = %rel.display(), "path not present in its parent container");
        }
        Err(_) => stats.errors += 1,
    }

    if side.dir.join(rel).is_dir() {
        delete_tree(side, stats, rel, &[])?;
    }
    Ok(())
}

/// Post-order removal of a directory subtree with full accounting: every
/// record decremented, every container file (current and stale) decremented
/// and unlinked, directories removed once empty.
pub(crate) fn delete_tree(
    side: &mut BackupSide,
    stats: &mut EngineStats,
    rel: &Path,
    skip: &[&str],
) -> Result<()> {
    let abs = side.dir.join(rel);

    for sub in walk::subdirs(&abs)? {
        if skip.contains(&sub.as_str()) {
            continue;
        }
        delete_tree(side, stats, &rel.join(&sub), &[])?;
    }

    let entries = match side.ac.load_dir(rel) {
        Ok(entries) => entries,
        Err(_) => {
            stats.errors += 1;
            Default::default()
        }
    };
    for rec in entries.values() {
        drop_record(side, stats, rec);
    }

    for (fname, digest) in attrib_files(&abs)? {
        side.emit(side.info.compress, Some(&digest), -1);
        if let Err(e) = fs::remove_file(abs.join(&fname)) {
            warn!(path = %abs.join(&fname).display(), error = %e, "failed to unlink container");
            stats.errors += 1;
        }
    }
    side.ac.forget_dir(rel);

    // Anything else in a payload directory is unexpected; clear it so the
    // rmdir can succeed.
    for entry in walk::dir_entries(&abs)? {
        if entry.is_dir && skip.contains(&entry.name.as_str()) {
            continue;
        }
        if !entry.is_dir {
            warn!(path = %abs.join(&entry.name).display(), "removing stray file");
            if let Err(e) = fs::remove_file(abs.join(&entry.name)) {
                warn!(error = %e, "failed to remove stray file");
                stats.errors += 1;
            }
        }
    }

    stats.dir_cnt += 1;
    if !rel.as_os_str().is_empty() {
        if let Err(e) = fs::remove_dir(&abs) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %abs.display(), error = %e, "failed to remove directory");
                stats.errors += 1;
            }
        }
    }
    Ok(())
}

/// Decrement and unlink every remaining inode-table container file. Record
/// digests inside were handled by per-reference decrements; anything left
/// over is an inconsistency for fsck to settle.
fn sweep_inode_containers(side: &mut BackupSide, stats: &mut EngineStats) -> Result<()> {
    let inode_root = side.dir.join("inode");
    if !inode_root.exists() {
        return Ok(());
    }
    for shard in walk::subdirs(&inode_root)? {
        let shard_abs = inode_root.join(&shard);
        for (fname, digest) in attrib_files(&shard_abs)? {
            side.emit(side.info.compress, Some(&digest), -1);
            if let Err(e) = fs::remove_file(shard_abs.join(&fname)) {
                warn!(path = %shard_abs.join(&fname).display(), error = %e,
                      "failed to unlink inode container");
                stats.errors += 1;
            }
        }
    }
    Ok(())
}

/// Remove `XferLOG.<num>*` and `SmbLOG.<num>*` from the host directory.
fn remove_backup_logs(host_dir: &Path, num: u32, stats: &mut EngineStats) {
    let prefixes = [format!("XferLOG.{num}"), format!("SmbLOG.{num}")];
    let Ok(entries) = fs::read_dir(host_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "failed to remove log");
                stats.errors += 1;
            }
        }
    }
}
