use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::Result;

/// One directory entry, as the walkers care about it.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
}

/// Read a directory, sorted by name. A missing directory reads as empty.
pub fn dir_entries(path: &Path) -> Result<Vec<DirEntryInfo>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(path) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        out.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().to_string(),
            is_dir: file_type.is_dir(),
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Names of the subdirectories of `path`, sorted.
pub fn subdirs(path: &Path) -> Result<Vec<String>> {
    Ok(dir_entries(path)?
        .into_iter()
        .filter(|e| e.is_dir)
        .map(|e| e.name)
        .collect())
}

/// Best-effort recursive removal. Failures are logged and counted, never
/// propagated; the caller folds the count into its error total.
pub fn rmtree_quiet(path: &Path) -> u64 {
    let mut errors = 0;
    let entries = match fs::read_dir(path) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read directory for removal");
            return 1;
        }
    };
    for entry in entries {
        let Ok(entry) = entry else {
            errors += 1;
            continue;
        };
        let child = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            errors += rmtree_quiet(&child);
        } else if let Err(e) = fs::remove_file(&child) {
            warn!(path = %child.display(), error = %e, "failed to remove file");
            errors += 1;
        }
    }
    if let Err(e) = fs::remove_dir(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove directory");
            errors += 1;
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_entries_sorted_and_typed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("zdir")).unwrap();
        fs::write(dir.path().join("afile"), b"x").unwrap();
        let entries = dir_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "afile");
        assert!(!entries[0].is_dir);
        assert_eq!(entries[1].name, "zdir");
        assert!(entries[1].is_dir);
    }

    #[test]
    fn missing_dir_reads_empty() {
        assert!(dir_entries(Path::new("/no/such/place")).unwrap().is_empty());
    }

    #[test]
    fn rmtree_removes_nested() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/file"), b"x").unwrap();
        assert_eq!(rmtree_quiet(&root), 0);
        assert!(!root.exists());
    }

    #[test]
    fn rmtree_on_missing_is_clean() {
        assert_eq!(rmtree_quiet(Path::new("/no/such/tree")), 0);
    }
}
