use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};

/// Server-wide configuration. Key names match the config files shipped with
/// earlier releases of the product, hence the PascalCase renames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BurrowConfig {
    /// Root of the pool, the per-host trees and the backup indexes.
    pub top_dir: String,
    /// Directory holding the companion tools (refCountUpdate among them).
    #[serde(default)]
    pub bin_dir: String,
    /// Per-host log directory root.
    #[serde(default)]
    pub log_dir: String,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Verbosity of the transfer log (0 = quiet).
    #[serde(default)]
    pub xfer_log_level: u32,
    /// Non-zero forces a full refcount fsck after every mutating run, so
    /// sentinels are left in place for it.
    #[serde(default)]
    pub ref_cnt_fsck: u32,
}

fn default_server_host() -> String {
    "localhost".to_string()
}

fn default_server_port() -> u16 {
    10080
}

impl BurrowConfig {
    pub fn top_dir(&self) -> &Path {
        Path::new(&self.top_dir)
    }

    /// Load a config file, YAML-encoded.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BurrowError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        serde_yaml::from_str(&text)
            .map_err(|e| BurrowError::Config(format!("cannot parse '{}': {e}", path.display())))
    }

    /// Resolve the config file path: explicit flag, then `$BURROW_CONFIG`,
    /// then `./burrow.yaml`, then the system location.
    pub fn resolve_path(explicit: Option<&str>) -> Option<PathBuf> {
        if let Some(p) = explicit {
            return Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("BURROW_CONFIG") {
            if !p.is_empty() {
                return Some(PathBuf::from(p));
            }
        }
        for candidate in ["burrow.yaml", "/etc/burrow/config.yaml"] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg: BurrowConfig = serde_yaml::from_str("TopDir: /var/lib/burrow\n").unwrap();
        assert_eq!(cfg.top_dir, "/var/lib/burrow");
        assert_eq!(cfg.server_host, "localhost");
        assert_eq!(cfg.server_port, 10080);
        assert_eq!(cfg.ref_cnt_fsck, 0);
    }

    #[test]
    fn parses_full_config() {
        let text = "\
TopDir: /data/burrow
BinDir: /usr/libexec/burrow
LogDir: /var/log/burrow
ServerHost: backup1
ServerPort: 9911
XferLogLevel: 2
RefCntFsck: 1
";
        let cfg: BurrowConfig = serde_yaml::from_str(text).unwrap();
        assert_eq!(cfg.bin_dir, "/usr/libexec/burrow");
        assert_eq!(cfg.server_host, "backup1");
        assert_eq!(cfg.server_port, 9911);
        assert_eq!(cfg.ref_cnt_fsck, 1);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = BurrowConfig::load(Path::new("/no/such/burrow.yaml")).unwrap_err();
        assert!(matches!(err, BurrowError::Config(_)));
    }
}
