//! In-memory mock filesystem for testing the `/proc` provider without Linux.

use crate::collector::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// In-memory filesystem for testing.
///
/// Besides files and directories it stores symbolic links, a set of paths
/// that fail with `PermissionDenied`, and a per-path read counter so tests
/// can verify how often the provider touched a file. Clones share the
/// counter.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
    directories: HashSet<PathBuf>,
    links: HashMap<PathBuf, PathBuf>,
    denied: HashSet<PathBuf>,
    reads: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    /// Adds a symbolic link pointing at `target`.
    pub fn add_link(&mut self, path: impl AsRef<Path>, target: impl Into<PathBuf>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.links.insert(path, target.into());
    }

    /// Makes every access to `path` fail with `PermissionDenied`.
    pub fn deny(&mut self, path: impl AsRef<Path>) {
        self.denied.insert(path.as_ref().to_path_buf());
    }

    /// Removes `path` and everything below it.
    pub fn remove_tree(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.files.retain(|p, _| !p.starts_with(path));
        self.directories.retain(|p| !p.starts_with(path));
        self.links.retain(|p, _| !p.starts_with(path));
    }

    /// Number of successful or failed reads of `path` so far.
    pub fn read_count(&self, path: impl AsRef<Path>) -> usize {
        self.reads
            .lock()
            .map(|reads| reads.get(path.as_ref()).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }

    fn record_read(&self, path: &Path) {
        if let Ok(mut reads) = self.reads.lock() {
            *reads.entry(path.to_path_buf()).or_insert(0) += 1;
        }
    }

    fn check_denied(&self, path: &Path) -> io::Result<()> {
        if self.denied.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {:?}", path),
            ));
        }
        Ok(())
    }
}

fn not_found(what: &str, path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found: {:?}", what, path),
    )
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.record_read(path);
        self.check_denied(path)?;
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found("file", path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
            || self.directories.contains(path)
            || self.links.contains_key(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.record_read(path);
        self.check_denied(path)?;
        if !self.directories.contains(path) {
            return Err(not_found("directory", path));
        }

        let mut entries = HashSet::new();
        let children = self
            .files
            .keys()
            .chain(self.links.keys())
            .chain(self.directories.iter());
        for child in children {
            if child != path && child.parent().is_some_and(|parent| parent == path) {
                entries.insert(child.clone());
            }
        }

        Ok(entries.into_iter().collect())
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.record_read(path);
        self.check_denied(path)?;
        self.links
            .get(path)
            .cloned()
            .ok_or_else(|| not_found("link", path))
    }
}
