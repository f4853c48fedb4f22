use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::Result;
use crate::refcnt::REFCNT_DIR;

/// On-disk markers bracketing multi-step mutations. A surviving marker
/// forces a full refcount fsck on the next server start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// `needFsck.del` — deletion/merge in progress.
    Delete,
    /// `needFsck.mig` — migration in progress.
    Migrate,
    /// `noPoolCntOk` — migration has not fully contributed; pool counts are
    /// known to be partial.
    PoolCountPartial,
}

impl Sentinel {
    pub fn file_name(self) -> &'static str {
        match self {
            Sentinel::Delete => "needFsck.del",
            Sentinel::Migrate => "needFsck.mig",
            Sentinel::PoolCountPartial => "noPoolCntOk",
        }
    }

    /// Create the sentinel before the first mutating step of its scope.
    pub fn create(self, backup_dir: &Path) -> Result<()> {
        let dir = backup_dir.join(REFCNT_DIR);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(self.file_name()), b"")?;
        Ok(())
    }

    pub fn exists(self, backup_dir: &Path) -> bool {
        backup_dir.join(REFCNT_DIR).join(self.file_name()).exists()
    }

    pub fn remove(self, backup_dir: &Path) -> Result<()> {
        let path = backup_dir.join(REFCNT_DIR).join(self.file_name());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the sentinel after a clean run, but only when no errors were
    /// counted and the fsck policy permits skipping the mandatory pass.
    /// Otherwise the sentinel stays so the next fsck reconciles.
    pub fn clear_on_success(self, backup_dir: &Path, errors: u64, ref_cnt_fsck: u32) {
        if errors == 0 && ref_cnt_fsck == 0 {
            if let Err(e) = self.remove(backup_dir) {
                warn!(backup = %backup_dir.display(), error = %e,
                      "failed to remove {}", self.file_name());
            }
        } else {
            info!(backup = %backup_dir.display(), errors,
                  "leaving {} in place for fsck", self.file_name());
        }
    }
}
