use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use burrow_types::Digest;

use crate::compress::CompressMode;
use crate::error::Result;

/// Directory under a backup root holding the delta journal and the
/// crash-safety sentinels.
pub const REFCNT_DIR: &str = "refCnt";

const DELTA_PREFIX: &str = "poolCntDelta_";

/// One journaled refcount change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub compress: CompressMode,
    pub digest: Digest,
    pub delta: i64,
}

/// Per-backup accumulator of pool refcount changes. Entries are summed in
/// memory and written out as journal files for the external reconciler;
/// the authoritative pool counts are only ever derived from the union of
/// all backups' journals.
pub struct RefCountDelta {
    backup_dir: PathBuf,
    entries: HashMap<(CompressMode, Digest), i64>,
    seq: u32,
}

impl RefCountDelta {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            entries: HashMap::new(),
            seq: 0,
        }
    }

    /// Accumulate a refcount change. Empty digests are tolerated and
    /// ignored; negative running totals are allowed (reconciliation is
    /// global).
    pub fn update(&mut self, compress: CompressMode, digest: Option<&Digest>, delta: i64) {
        let Some(digest) = digest else { return };
        *self.entries.entry((compress, *digest)).or_insert(0) += delta;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|d| *d == 0)
    }

    /// Pending (unflushed) delta for one digest; test and audit hook.
    pub fn pending(&self, compress: CompressMode, digest: &Digest) -> i64 {
        self.entries.get(&(compress, *digest)).copied().unwrap_or(0)
    }

    /// Write the accumulated deltas to a fresh journal file under
    /// `<backup>/refCnt/` and clear the accumulator. Zero-sum entries are
    /// dropped; an all-zero accumulator writes nothing.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        let mut list: Vec<DeltaEntry> = self
            .entries
            .drain()
            .filter(|(_, delta)| *delta != 0)
            .map(|((compress, digest), delta)| DeltaEntry {
                compress,
                digest,
                delta,
            })
            .collect();
        if list.is_empty() {
            return Ok(None);
        }
        list.sort_by_key(|e| (e.compress.as_tag(), e.digest));

        let dir = self.backup_dir.join(REFCNT_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "{DELTA_PREFIX}{}_{}",
            self.seq,
            std::process::id()
        ));
        self.seq += 1;
        fs::write(&path, rmp_serde::to_vec(&list)?)?;
        debug!(path = %path.display(), entries = list.len(), "flushed refcount deltas");
        Ok(Some(path))
    }
}

/// Decode one journal file.
pub fn read_delta_file(path: &Path) -> Result<Vec<DeltaEntry>> {
    Ok(rmp_serde::from_slice(&fs::read(path)?)?)
}

/// Sum every journal file under a backup's `refCnt/` directory. Used by the
/// reconciler and by tests asserting neutrality properties.
pub fn read_journal(backup_dir: &Path) -> Result<HashMap<(CompressMode, Digest), i64>> {
    let mut totals = HashMap::new();
    let dir = backup_dir.join(REFCNT_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(totals),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(DELTA_PREFIX) {
            continue;
        }
        for e in read_delta_file(&entry.path())? {
            *totals.entry((e.compress, e.digest)).or_insert(0) += e.delta;
        }
    }
    Ok(totals)
}

/// Ask the external reconciler to rebuild this host's pool counts from the
/// journals. Best-effort: a missing or failing tool is logged, never fatal,
/// because any surviving sentinel forces a full fsck anyway.
pub fn request_reconcile(config: &crate::config::BurrowConfig, host: &str) {
    if config.bin_dir.is_empty() {
        return;
    }
    let tool = std::path::Path::new(&config.bin_dir).join("refCountUpdate");
    match std::process::Command::new(&tool).arg("-h").arg(host).spawn() {
        Ok(_) => debug!(host, tool = %tool.display(), "enqueued refcount reconciliation"),
        Err(e) => tracing::warn!(host, tool = %tool.display(), error = %e,
                                 "cannot start refcount reconciler"),
    }
}
