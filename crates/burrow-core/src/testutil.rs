use std::path::Path;

use chrono::Utc;

use crate::backups::{BackupInfo, BackupList};
use crate::compress::CompressMode;
use crate::config::BurrowConfig;

/// Config pointing at a temp TopDir; the server port is never contacted
/// because tests always skip the mutex.
pub fn test_config(top_dir: &Path) -> BurrowConfig {
    BurrowConfig {
        top_dir: top_dir.to_string_lossy().to_string(),
        bin_dir: String::new(),
        log_dir: String::new(),
        server_host: "127.0.0.1".to_string(),
        server_port: 1,
        xfer_log_level: 0,
        ref_cnt_fsck: 0,
    }
}

pub fn backup_info(num: u32, version: u32, compress: CompressMode, no_fill: bool) -> BackupInfo {
    BackupInfo {
        num,
        version,
        compress,
        no_fill,
        keep: false,
        inode_last: 0,
        start_time: Utc::now(),
    }
}

/// Write the host's backup index from scratch.
pub fn write_backup_list(host_dir: &Path, backups: Vec<BackupInfo>) {
    std::fs::create_dir_all(host_dir).unwrap();
    let mut list = BackupList::load(host_dir).unwrap();
    list.backups = backups;
    list.save().unwrap();
}
