// SPDX-License-Identifier: Apache-2.0

//! Stable keys for tailed files.
//!
//! On Unix a file is keyed by path plus inode, so a new file created at the
//! same path (rotation) gets a new key and its own checkpoint. Platforms
//! without inode semantics fall back to the path alone.

use std::fmt::Debug;
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::sync::Arc;

pub trait FileIdentity: Send + Sync + Debug {
    /// Key for a file whose metadata has already been read.
    fn key_for(&self, path: &Path, metadata: &Metadata) -> String;

    /// Key for the file currently at `path`.
    fn identity(&self, path: &Path) -> io::Result<String> {
        let metadata = std::fs::metadata(path)?;
        Ok(self.key_for(path, &metadata))
    }
}

/// `<path>::<inode>` keys.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeIdentity;

#[cfg(unix)]
impl FileIdentity for InodeIdentity {
    fn key_for(&self, path: &Path, metadata: &Metadata) -> String {
        use std::os::unix::fs::MetadataExt;

        format!("{}::{}", path.display(), metadata.ino())
    }
}

/// `<path>` keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathIdentity;

impl FileIdentity for PathIdentity {
    fn key_for(&self, path: &Path, _metadata: &Metadata) -> String {
        path.display().to_string()
    }
}

/// The identity scheme for the platform we were built for.
pub fn platform_identity() -> Arc<dyn FileIdentity> {
    #[cfg(unix)]
    {
        Arc::new(InodeIdentity)
    }
    #[cfg(not(unix))]
    {
        Arc::new(PathIdentity)
    }
}

/// Inode number, where the platform has one.
pub fn inode(metadata: &Metadata) -> Option<u64> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(metadata.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_path_identity_ignores_inode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "a").unwrap();

        let before = PathIdentity.identity(&path).unwrap();
        fs::remove_file(&path).unwrap();
        fs::write(&path, "b").unwrap();

        assert_eq!(before, PathIdentity.identity(&path).unwrap());
        assert_eq!(before, path.display().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_inode_identity_changes_on_recreate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let rotated = dir.path().join("app.log.1");
        fs::write(&path, "a").unwrap();

        let before = InodeIdentity.identity(&path).unwrap();
        assert!(before.starts_with(&format!("{}::", path.display())));

        fs::rename(&path, &rotated).unwrap();
        fs::write(&path, "b").unwrap();

        assert_ne!(before, InodeIdentity.identity(&path).unwrap());
    }

    #[test]
    fn test_identity_of_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = platform_identity()
            .identity(&dir.path().join("missing.log"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
