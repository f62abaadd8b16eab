//! Scratch paths for tests.
//!
//! Every path lives under one per-crate directory inside the system temp
//! dir and is made unique by the process id plus a process-local counter,
//! so parallel tests and parallel test processes never collide. Whatever a
//! test leaves at the path is removed on drop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCRATCH_ID: AtomicU64 = AtomicU64::new(0);

fn scratch_path(kind: &str) -> std::io::Result<PathBuf> {
    let base = std::env::temp_dir().join("embercache_tests");
    fs::create_dir_all(&base)?;
    let id = NEXT_SCRATCH_ID.fetch_add(1, Ordering::SeqCst);
    Ok(base.join(format!("{kind}_{}_{id}", std::process::id())))
}

/// A fresh directory, deleted recursively on drop.
pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let path = scratch_path("dir")?;
        // A recycled pid can land on a leftover from a crashed run.
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir(&path)?;
        Ok(Self(path))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

/// A reserved file path, deleted on drop. The file itself is created by
/// the code under test.
pub struct NamedTempFile(PathBuf);

impl NamedTempFile {
    pub fn new() -> std::io::Result<Self> {
        scratch_path("file").map(Self)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for NamedTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_paths_are_unique() {
        let a = NamedTempFile::new().expect("temp file");
        let b = NamedTempFile::new().expect("temp file");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_temp_dir_removed_on_drop() {
        let kept;
        {
            let dir = TempDir::new().expect("temp dir");
            kept = dir.path().to_path_buf();
            fs::write(dir.path().join("scratch"), b"x").expect("write");
            assert!(kept.exists());
        }
        assert!(!kept.exists());
    }
}
