use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::{info, warn};

use burrow_types::digest::V3_DIGEST_WINDOW;
use burrow_types::Digest;

use crate::attrib::{decode_container, AttributeRecord, Container, FileType};
use crate::backups::BackupList;
use crate::compress::{self, CompressMode};
use crate::config::BurrowConfig;
use crate::delete::BackupSide;
use crate::error::{BurrowError, Result};
use crate::layout::{self, Layout};
use crate::pool;
use crate::progress::{EngineStats, Progress};
use crate::refcnt::{self, REFCNT_DIR};
use crate::sentinel::Sentinel;
use crate::server::ServerClient;
use crate::walk;

/// Per-directory attribute file name in the legacy layout.
const V3_ATTRIB: &str = "attrib";

pub struct MigrateRequest {
    pub host: String,
    /// Migrate one backup; `None` migrates every pre-V4 backup of the host.
    pub num: Option<u32>,
    /// Announce what would be migrated without touching anything.
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct MigrateStats {
    pub migrated: u32,
    pub skipped: u32,
    pub file_cnt: u64,
    pub dir_cnt: u64,
    pub errors: u64,
}

/// Physical inode → (content address, uncompressed size) memo, spanning all
/// backups of one host so hard-linked files are streamed once.
type Inode2Digest = HashMap<u64, (Digest, u64)>;

/// Convert legacy backups of a host into the V4 layout: fresh attribute
/// containers, a per-backup inode table namespace, refcount journal
/// contributions for every referenced digest, and pool blobs carried over
/// by hard link wherever the legacy pool already holds the content.
pub fn run(config: &BurrowConfig, req: &MigrateRequest, progress: &mut Progress) -> Result<MigrateStats> {
    let layout = Layout::new(&config.top_dir);
    let host_dir = layout.host_dir(&req.host);
    let mut list = BackupList::load(&host_dir)?;

    if !req.dry_run && ServerClient::from_config(config).is_running() {
        return Err(BurrowError::ServerRunning);
    }

    let nums: Vec<u32> = match req.num {
        Some(num) => {
            list.find(num)
                .ok_or_else(|| BurrowError::BackupNotFound {
                    host: req.host.clone(),
                    num,
                })?;
            vec![num]
        }
        None => list
            .backups
            .iter()
            .filter(|b| !b.is_v4())
            .map(|b| b.num)
            .collect(),
    };

    let mut stats = MigrateStats {
        migrated: 0,
        skipped: 0,
        file_cnt: 0,
        dir_cnt: 0,
        errors: 0,
    };
    let mut memo = Inode2Digest::new();

    for num in nums {
        let backup = list.find(num).cloned().expect("selected from list");
        let src = layout.backup_dir(&req.host, num);

        if backup.is_v4() || src.join(REFCNT_DIR).is_dir() {
            progress.note(&format!("backup #{num} is already V4, nothing to do"));
            stats.skipped += 1;
            continue;
        }
        if req.dry_run {
            progress.note(&format!("would migrate backup #{num} of {}", req.host));
            stats.skipped += 1;
            continue;
        }

        progress.state(&format!("migrate #{num}"));
        let mut engine = EngineStats::default();
        match migrate_backup(config, &layout, &mut list, req, num, &mut memo, &mut engine, progress)
        {
            Ok(()) => stats.migrated += 1,
            Err(e) => {
                warn!(host = %req.host, num, error = %e, "migration of backup failed");
                engine.errors += 1;
            }
        }
        stats.file_cnt += engine.file_cnt;
        stats.dir_cnt += engine.dir_cnt;
        stats.errors += engine.errors;
    }

    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn migrate_backup(
    config: &BurrowConfig,
    layout: &Layout,
    list: &mut BackupList,
    req: &MigrateRequest,
    num: u32,
    memo: &mut Inode2Digest,
    stats: &mut EngineStats,
    progress: &mut Progress,
) -> Result<()> {
    let host_dir = layout.host_dir(&req.host);
    let src = layout.backup_dir(&req.host, num);
    let dest = host_dir.join(format!("{num}.v4"));
    let backup = list.find(num).cloned().expect("caller checked");

    // A leftover destination from an interrupted run restarts from scratch.
    if dest.exists() {
        warn!(dest = %dest.display(), "removing stale migration destination");
        walk::rmtree_quiet(&dest);
    }
    fs::create_dir_all(&dest)?;
    Sentinel::Migrate.create(&dest)?;
    Sentinel::PoolCountPartial.create(&dest)?;

    // The destination tree is `<num>.v4` until the commit swap.
    let mut info = backup.clone();
    info.version = 4;
    let mut side = BackupSide::at(dest.clone(), info, layout.clone());

    let mut next_inode = backup.inode_last.max(list.max_inode_last()) + 1;
    let errors_before = stats.errors;

    migrate_dir(
        layout,
        &mut side,
        &src,
        Path::new(""),
        memo,
        &mut next_inode,
        stats,
    )?;
    progress.file_count(stats);

    side.ac.flush(true)?;
    side.drc.borrow_mut().flush()?;

    // Swap the migrated tree into place; best-effort rollback on failure.
    let old = host_dir.join(format!("{num}.old"));
    fs::rename(&src, &old)?;
    if let Err(e) = fs::rename(&dest, &src) {
        warn!(error = %e, "cannot swap migrated tree into place, rolling back");
        if let Err(e) = fs::rename(&old, &src) {
            warn!(error = %e, "rollback failed; legacy tree left at {}", old.display());
        }
        return Err(e.into());
    }
    stats.errors += walk::rmtree_quiet(&old);

    if let Some(entry) = list.find_mut(num) {
        entry.version = 4;
        entry.inode_last = next_inode.saturating_sub(1);
    }
    list.save()?;

    let errors_here = stats.errors - errors_before;
    Sentinel::Migrate.clear_on_success(&src, errors_here, config.ref_cnt_fsck);
    refcnt::request_reconcile(config, &req.host);
    info!(host = %req.host, num, errors = errors_here, "backup migrated to V4");
    Ok(())
}

/// Migrate one directory: unite the legacy container with a directory scan,
/// content-address every payload record, and write the V4 container into
/// the destination tree.
fn migrate_dir(
    layout: &Layout,
    side: &mut BackupSide,
    src_root: &Path,
    rel: &Path,
    memo: &mut Inode2Digest,
    next_inode: &mut u64,
    stats: &mut EngineStats,
) -> Result<()> {
    stats.dir_cnt += 1;
    let src_abs = src_root.join(rel);
    fs::create_dir_all(side.dir.join(rel))?;

    let mut entries = read_v3_container(&src_abs, stats);

    // Entries present on disk but missing from the container get records
    // synthesized from stat.
    for e in walk::dir_entries(&src_abs)? {
        if !layout::is_mangled(&e.name) {
            continue;
        }
        let Some(name) = layout::unmangle_element(&e.name) else {
            warn!(entry = %e.name, "unmanglable entry name, skipping");
            stats.errors += 1;
            continue;
        };
        if entries.contains_key(&name) {
            continue;
        }
        match synthesize_record(&src_abs.join(&e.name), &name) {
            Ok(rec) => {
                entries.insert(name, rec);
            }
            Err(err) => {
                warn!(entry = %e.name, error = %err, "stat failed, skipping entry");
                stats.errors += 1;
            }
        }
    }

    for (name, mut rec) in entries {
        let mangled = layout::mangle_element(&name);
        let src_child = src_abs.join(&mangled);
        let child_rel = rel.join(&mangled);

        if rec.is_dir() || src_child.is_dir() {
            rec.ftype = FileType::Dir;
            rec.digest = None;
            rec.compress = side.info.compress;
            rec.inode = *next_inode;
            *next_inode += 1;
            rec.nlinks = 0;
            side.ac.set(rel, rec)?;
            migrate_dir(layout, side, src_root, &child_rel, memo, next_inode, stats)?;
            continue;
        }

        stats.file_cnt += 1;
        if matches!(rec.ftype, FileType::Fifo | FileType::Socket) {
            // No payload to address; carried as an empty-digest file entry.
            rec.ftype = FileType::File;
            rec.digest = None;
        } else if rec.ftype.has_content() && src_child.is_file() {
            match migrate_content(layout, side, &src_child, memo, stats) {
                Ok((digest, size)) => {
                    rec.digest = Some(digest);
                    if rec.size == 0 {
                        rec.size = size;
                    }
                }
                Err(e) => {
                    warn!(path = %src_child.display(), error = %e, "cannot migrate content");
                    stats.errors += 1;
                    rec.digest = None;
                }
            }
        } else {
            rec.digest = None;
        }

        rec.compress = side.info.compress;
        // Legacy dedup was filesystem hard links into the pool, so every
        // record stands alone; the inode namespace is still consumed to
        // stay disjoint across the host's backups.
        rec.inode = *next_inode;
        *next_inode += 1;
        rec.nlinks = 0;
        side.ac.set(rel, rec)?;
    }
    Ok(())
}

fn read_v3_container(src_abs: &Path, stats: &mut EngineStats) -> Container {
    let path = src_abs.join(V3_ATTRIB);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Container::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read legacy container");
            stats.errors += 1;
            return Container::new();
        }
    };
    match decode_container(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot decode legacy container");
            stats.errors += 1;
            Container::new()
        }
    }
}

fn synthesize_record(path: &Path, name: &str) -> Result<AttributeRecord> {
    let meta = fs::symlink_metadata(path)?;
    let ftype = if meta.is_dir() {
        FileType::Dir
    } else {
        FileType::File
    };
    Ok(AttributeRecord {
        name: name.to_string(),
        ftype,
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        // True uncompressed size is filled in when the content streams.
        size: 0,
        mtime: meta.mtime(),
        digest: None,
        compress: CompressMode::None,
        inode: 0,
        nlinks: 0,
        no_attrib: ftype == FileType::Dir,
    })
}

/// Content-address one legacy payload file and make sure the blob is
/// reachable in the V4 pool: by the existing hard link, by adopting the
/// legacy pool entry, or by writing it out. One `+1` is journaled per memo
/// miss; hard-linked paths resolve through the memo without re-streaming.
fn migrate_content(
    layout: &Layout,
    side: &mut BackupSide,
    path: &Path,
    memo: &mut Inode2Digest,
    stats: &mut EngineStats,
) -> Result<(Digest, u64)> {
    let meta = fs::metadata(path)?;
    let ino = meta.ino();
    if let Some((digest, size)) = memo.get(&ino) {
        return Ok((*digest, *size));
    }

    let mode = side.info.compress;
    let data = compress::read_file(path)?;
    let ulen = data.len() as u64;
    let digest = Digest::of(&data);
    let window = &data[..data.len().min(V3_DIGEST_WINDOW)];
    let v3_digest = Digest::v3_of(ulen, window);

    // Empty content is in-pool by convention; everything else must end up
    // reachable under its V4 path.
    if ulen > 0 {
        let v4_path = layout.pool_path(mode, &digest);
        let already_linked = fs::metadata(&v4_path)
            .map(|m| m.ino() == ino)
            .unwrap_or(false);
        if !already_linked {
            match pool::v3_chain_find(layout, mode, &v3_digest, ino)? {
                Some(v3_path) => adopt_chain_entry(&v3_path, &v4_path, ino, stats),
                None => {
                    let res = pool::pool_write(layout, mode, &data)?;
                    stats.errors += res.errors;
                }
            }
        }
    }

    memo.insert(ino, (digest, ulen));
    side.emit(mode, Some(&digest), 1);
    Ok((digest, ulen))
}

/// Move a legacy pool blob into the V4 pool by hard link, then retire the
/// legacy name. A failed link that nevertheless leaves the V4 entry
/// pointing at our inode was raced by another path of the same hard-link
/// group; that earlier failure is benign and is not counted.
fn adopt_chain_entry(v3_path: &Path, v4_path: &Path, ino: u64, stats: &mut EngineStats) {
    let mut link_failed = false;
    if let Some(parent) = v4_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "cannot create pool directory");
            link_failed = true;
        }
    }
    if !link_failed {
        if let Err(e) = fs::hard_link(v3_path, v4_path) {
            warn!(src = %v3_path.display(), dst = %v4_path.display(), error = %e,
                  "pool link failed");
            link_failed = true;
        }
    }
    if let Err(e) = fs::remove_file(v3_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %v3_path.display(), error = %e, "cannot retire legacy pool entry");
        }
    }

    if link_failed {
        let benign = fs::metadata(v4_path).map(|m| m.ino() == ino).unwrap_or(false);
        if !benign {
            stats.errors += 1;
        }
    }
}
