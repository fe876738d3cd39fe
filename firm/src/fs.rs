//! SD card access.
//!
//! Paths are relative to the card root and use `/` separators.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crate::error::{Error, Result};

pub trait FileSystem: Send + Sync {
    /// Reads up to `buf.len()` bytes from the start of `path`.
    ///
    /// # Errors
    /// [`Error::NoFile`] if the file does not exist, I/O errors otherwise.
    fn quick_read(&self, path: &str, buf: &mut [u8]) -> Result<usize>;

    /// Creates or truncates `path` and writes `data`.
    ///
    /// # Errors
    /// I/O errors, including a missing parent directory.
    fn quick_write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Creates `path` and every missing parent.
    ///
    /// # Errors
    /// I/O errors.
    fn make_dir(&self, path: &str) -> Result<()>;
}

/// Directory on the host standing in for the SD card.
#[derive(Debug, Clone)]
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl FileSystem for HostFs {
    fn quick_read(&self, path: &str, buf: &mut [u8]) -> Result<usize> {
        let data = fs::read(self.resolve(path)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NoFile(path.to_owned()),
            _ => Error::Io(e),
        })?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn quick_write(&self, path: &str, data: &[u8]) -> Result<()> {
        Ok(fs::write(self.resolve(path), data)?)
    }

    fn make_dir(&self, path: &str) -> Result<()> {
        Ok(fs::create_dir_all(self.resolve(path))?)
    }
}

/// In-memory card that counts writes and can be told to fail them.
#[derive(Debug, Default)]
pub struct MemFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.files().insert(path.to_owned(), data);
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files().get(path).cloned()
    }

    /// Paths starting with `prefix`, sorted.
    #[must_use]
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .files()
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Successful writes so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl FileSystem for MemFs {
    fn quick_read(&self, path: &str, buf: &mut [u8]) -> Result<usize> {
        let files = self.files();
        let data = files.get(path).ok_or_else(|| Error::NoFile(path.to_owned()))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn quick_write(&self, path: &str, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::Io(io::Error::other("card write failed")));
        }
        self.files().insert(path.to_owned(), data.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn make_dir(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_file_is_distinct() {
        let fs = MemFs::new();
        let mut buf = [0; 4];
        assert!(matches!(fs.quick_read("a.sav", &mut buf), Err(Error::NoFile(_))));
    }

    #[test]
    fn write_then_read() {
        let fs = MemFs::new();
        fs.quick_write("a.sav", &[1, 2, 3]).unwrap();
        let mut buf = [0; 8];
        assert_eq!(fs.quick_read("a.sav", &mut buf).unwrap(), 3);
        assert_eq!(buf[..3], [1, 2, 3]);
        assert_eq!(fs.writes(), 1);
    }

    #[test]
    fn host_fs_round_trip() {
        let dir = std::env::temp_dir().join(format!("openagb-fs-{}", std::process::id()));
        let fs = HostFs::new(&dir);
        fs.make_dir("screenshots").unwrap();
        fs.quick_write("screenshots/x.bin", &[9; 4]).unwrap();

        let mut buf = [0; 4];
        assert_eq!(fs.quick_read("/screenshots/x.bin", &mut buf).unwrap(), 4);
        assert!(matches!(fs.quick_read("nope", &mut buf), Err(Error::NoFile(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
