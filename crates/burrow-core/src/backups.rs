use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compress::CompressMode;
use crate::error::{BurrowError, Result};

const BACKUPS_FILE: &str = "backups";

/// One backup of a host, as recorded in the per-host index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub num: u32,
    pub version: u32,
    pub compress: CompressMode,
    /// True: this backup is an unfilled incremental, meaningful only
    /// together with its base. False: filled, self-sufficient.
    #[serde(rename = "noFill")]
    pub no_fill: bool,
    #[serde(default)]
    pub keep: bool,
    /// Highest inode number assigned within this backup.
    #[serde(rename = "inodeLast", default)]
    pub inode_last: u64,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
}

impl BackupInfo {
    pub fn is_v4(&self) -> bool {
        self.version >= 4
    }
}

/// The per-host backup index: `pc/<host>/backups`, a JSON array ordered by
/// backup number.
#[derive(Debug)]
pub struct BackupList {
    host_dir: PathBuf,
    pub backups: Vec<BackupInfo>,
}

impl BackupList {
    /// Load the index for a host. The host directory must exist; a missing
    /// index file means no backups yet.
    pub fn load(host_dir: &Path) -> Result<Self> {
        if !host_dir.is_dir() {
            let host = host_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            return Err(BurrowError::HostNotFound(host));
        }
        let path = host_dir.join(BACKUPS_FILE);
        let backups = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                BurrowError::InvalidFormat(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut list = Self {
            host_dir: host_dir.to_path_buf(),
            backups,
        };
        list.backups.sort_by_key(|b| b.num);
        Ok(list)
    }

    /// Persist the index, atomically replacing the previous file.
    pub fn save(&self) -> Result<()> {
        let path = self.host_dir.join(BACKUPS_FILE);
        let tmp = self.host_dir.join(format!("{BACKUPS_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(&self.backups)
            .map_err(|e| BurrowError::Other(format!("encode backups index: {e}")))?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn find(&self, num: u32) -> Option<&BackupInfo> {
        self.backups.iter().find(|b| b.num == num)
    }

    pub fn find_mut(&mut self, num: u32) -> Option<&mut BackupInfo> {
        self.backups.iter_mut().find(|b| b.num == num)
    }

    /// The immediate predecessor of a backup: highest number below it.
    pub fn merge_candidate(&self, num: u32) -> Option<&BackupInfo> {
        self.backups
            .iter()
            .filter(|b| b.num < num)
            .max_by_key(|b| b.num)
    }

    /// Remove a backup from the index. Returns the removed entry.
    pub fn remove(&mut self, num: u32) -> Option<BackupInfo> {
        let pos = self.backups.iter().position(|b| b.num == num)?;
        Some(self.backups.remove(pos))
    }

    /// Highest inode number consumed by any backup of this host.
    pub fn max_inode_last(&self) -> u64 {
        self.backups.iter().map(|b| b.inode_last).max().unwrap_or(0)
    }
}
