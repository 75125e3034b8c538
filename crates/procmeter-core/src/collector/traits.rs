//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait lets the `/proc` provider read from the real
//! filesystem on Linux or from `MockFs` in tests.

use std::io;
use std::path::{Path, PathBuf};

/// Abstraction for the filesystem operations the provider needs.
pub trait FileSystem {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Reads the target of a symbolic link (`/proc/[pid]/cwd`, `/proc/[pid]/exe`).
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    /// Creates a new `RealFs` instance.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_fs_read_to_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comm");
        std::fs::write(&path, "sleep\n").unwrap();

        let fs = RealFs::new();
        assert_eq!(fs.read_to_string(&path).unwrap(), "sleep\n");
    }

    #[test]
    fn test_real_fs_exists() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFs::new();
        assert!(fs.exists(dir.path()));
        assert!(!fs.exists(Path::new("/nonexistent/path/12345")));
    }

    #[test]
    fn test_real_fs_read_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "").unwrap();
        std::fs::write(dir.path().join("b"), "").unwrap();

        let fs = RealFs::new();
        let entries = fs.read_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_real_fs_read_link() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("cwd");
        std::os::unix::fs::symlink("/tmp", &link).unwrap();

        let fs = RealFs::new();
        assert_eq!(fs.read_link(&link).unwrap(), PathBuf::from("/tmp"));
    }
}
