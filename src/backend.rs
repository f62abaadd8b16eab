//! Durable storage behind the cache.
//!
//! The cache manager only sees this trait; the production implementer is the
//! LSM engine. `FileBackend` is a deliberately simple alternative kept for
//! tests of the cache/manager layers.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::Result;

/// A free-threaded durable key-value store. Implementations synchronize
/// internally; callers may invoke any method from any thread.
pub trait StorageBackend: Send + Sync {
    /// Reads a single key. `Ok(None)` means the key is absent.
    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Writes a single key-value pair (upsert).
    fn store(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Deletes a key. Deleting an absent key is not an error.
    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Writes a batch of pairs. The default just loops over `store`;
    /// implementations override this to amortize their write costs.
    fn batch_store(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        for (key, value) in entries {
            self.store(key, value)?;
        }
        Ok(())
    }

    /// Liveness probe.
    fn ping(&self) -> bool;
}

/// Line-per-entry file store: `KEY\tVALUE\n`, whole file rewritten on every
/// mutation. Loads everything into memory at open. Tab and newline bytes in
/// keys or values are not supported, which is fine for its test role.
pub struct FileBackend {
    path: PathBuf,
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl FileBackend {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut data = HashMap::new();

        if let Ok(contents) = fs::read(&path) {
            for line in contents.split(|&b| b == b'\n') {
                let Some(tab) = line.iter().position(|&b| b == b'\t') else {
                    continue;
                };
                data.insert(line[..tab].to_vec(), line[tab + 1..].to_vec());
            }
        }

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Number of entries currently on disk.
    pub fn disk_size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn rewrite(&self, data: &HashMap<Vec<u8>, Vec<u8>>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = fs::File::create(&self.path)?;
        for (key, value) in data {
            file.write_all(key)?;
            file.write_all(b"\t")?;
            file.write_all(value)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_vec(), value.to_vec());
        self.rewrite(&data)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.remove(key).is_some() {
            self.rewrite(&data)?;
        }
        Ok(())
    }

    fn batch_store(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        for (key, value) in entries {
            data.insert(key.clone(), value.clone());
        }
        self.rewrite(&data)
    }

    fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;

    #[test]
    fn test_store_load_remove() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let backend = FileBackend::open(file.path())?;

        backend.store(b"k1", b"v1")?;
        backend.store(b"k2", b"v2")?;
        assert_eq!(backend.load(b"k1")?, Some(b"v1".to_vec()));
        assert_eq!(backend.load(b"missing")?, None);

        backend.remove(b"k1")?;
        assert_eq!(backend.load(b"k1")?, None);
        assert_eq!(backend.disk_size(), 1);
        Ok(())
    }

    #[test]
    fn test_reopen_recovers_contents() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        {
            let backend = FileBackend::open(file.path())?;
            backend.batch_store(&[
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ])?;
        }

        let backend = FileBackend::open(file.path())?;
        assert_eq!(backend.load(b"a")?, Some(b"1".to_vec()));
        assert_eq!(backend.load(b"b")?, Some(b"2".to_vec()));
        assert_eq!(backend.disk_size(), 2);
        Ok(())
    }

    #[test]
    fn test_batch_store_overwrites() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let backend = FileBackend::open(file.path())?;

        backend.store(b"a", b"old")?;
        backend.batch_store(&[(b"a".to_vec(), b"new".to_vec())])?;
        assert_eq!(backend.load(b"a")?, Some(b"new".to_vec()));
        Ok(())
    }
}
