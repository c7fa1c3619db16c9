//! On-disk storage for cached file content
//!
//! Each cached file gets one flat blob file under the blob directory, named
//! by a hash of its path. Keeping the layout flat means a file and a
//! directory with the same name never collide on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::path;

/// Blob file name for a path
pub fn blob_name(file_path: &str) -> String {
    hex::encode(Sha256::digest(path::normalize(file_path).as_bytes()))
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, file_path: &str) -> PathBuf {
        self.root.join(blob_name(file_path))
    }

    pub fn exists(&self, file_path: &str) -> bool {
        self.blob_path(file_path).is_file()
    }

    pub fn size(&self, file_path: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.blob_path(file_path))?.len())
    }

    pub fn read_all(&self, file_path: &str) -> io::Result<Bytes> {
        Ok(Bytes::from(fs::read(self.blob_path(file_path))?))
    }

    /// Read up to `len` bytes starting at `offset`; short at end of file
    pub fn read(&self, file_path: &str, offset: u64, len: usize) -> io::Result<Bytes> {
        let mut file = File::open(self.blob_path(file_path))?;
        let size = file.metadata()?.len();
        if offset >= size {
            return Ok(Bytes::new());
        }

        let len = len.min((size - offset) as usize);
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn staged_path(&self, file_path: &str) -> PathBuf {
        self.blob_path(file_path).with_extension("tmp")
    }

    /// Replace a blob's content
    ///
    /// Written to a temporary file first so a reader never sees a half
    /// written blob.
    pub fn write_all(&self, file_path: &str, data: &[u8]) -> io::Result<()> {
        self.stage(file_path, data)?;
        self.commit_staged(file_path)
    }

    /// Write content beside a blob without touching the blob itself
    ///
    /// Finished by `commit_staged` or `discard_staged`.
    pub fn stage(&self, file_path: &str, data: &[u8]) -> io::Result<()> {
        let mut file = File::create(self.staged_path(file_path))?;
        file.write_all(data)?;
        file.sync_data()
    }

    /// Replace the blob with its staged content
    pub fn commit_staged(&self, file_path: &str) -> io::Result<()> {
        fs::rename(self.staged_path(file_path), self.blob_path(file_path))
    }

    pub fn discard_staged(&self, file_path: &str) -> io::Result<()> {
        match fs::remove_file(self.staged_path(file_path)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Write at an offset, creating the blob if missing; returns the new size
    pub fn write_at(&self, file_path: &str, offset: u64, data: &[u8]) -> io::Result<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.blob_path(file_path))?;
        // seeking past the end leaves a zero-filled gap
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(file.metadata()?.len())
    }

    /// Resize a blob, creating it if missing
    pub fn truncate(&self, file_path: &str, size: u64) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.blob_path(file_path))?;
        file.set_len(size)
    }

    /// Create an empty blob, clearing any previous content
    pub fn create(&self, file_path: &str) -> io::Result<()> {
        File::create(self.blob_path(file_path)).map(|_| ())
    }

    pub fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.blob_path(from), self.blob_path(to))
    }

    /// Remove a blob; removing a missing blob is not an error
    pub fn remove(&self, file_path: &str) -> io::Result<()> {
        match fs::remove_file(self.blob_path(file_path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every blob on disk as (blob name, size)
    pub fn scan(&self) -> io::Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") {
                continue;
            }
            out.push((name, meta.len()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_and_read_range() {
        let (_dir, store) = store();
        store.write_all("/a.txt", b"hello world").unwrap();

        assert_eq!(store.read("/a.txt", 6, 100).unwrap(), "world");
        assert_eq!(store.read("/a.txt", 0, 5).unwrap(), "hello");
        assert!(store.read("/a.txt", 50, 5).unwrap().is_empty());
        assert_eq!(store.size("/a.txt").unwrap(), 11);
    }

    #[test]
    fn test_write_at_extends_with_zeros() {
        let (_dir, store) = store();
        let size = store.write_at("/sparse", 4, b"ab").unwrap();

        assert_eq!(size, 6);
        assert_eq!(store.read_all("/sparse").unwrap(), &b"\0\0\0\0ab"[..]);
    }

    #[test]
    fn test_truncate_and_remove() {
        let (_dir, store) = store();
        store.write_all("/a", b"abcdef").unwrap();
        store.truncate("/a", 2).unwrap();
        assert_eq!(store.read_all("/a").unwrap(), "ab");

        store.remove("/a").unwrap();
        assert!(!store.exists("/a"));
        // second removal is a no-op
        store.remove("/a").unwrap();
    }

    #[test]
    fn test_staged_content_replaces_blob_only_on_commit() {
        let (_dir, store) = store();
        store.write_all("/a", b"local").unwrap();

        store.stage("/a", b"fetched").unwrap();
        assert_eq!(store.read_all("/a").unwrap(), "local");
        assert_eq!(store.scan().unwrap().len(), 1);
        store.discard_staged("/a").unwrap();
        assert_eq!(store.read_all("/a").unwrap(), "local");

        store.stage("/a", b"fetched").unwrap();
        store.commit_staged("/a").unwrap();
        assert_eq!(store.read_all("/a").unwrap(), "fetched");
        // nothing left to discard
        store.discard_staged("/a").unwrap();
    }

    #[test]
    fn test_scan_lists_blob_names() {
        let (_dir, store) = store();
        store.write_all("/x", b"123").unwrap();

        let scanned = store.scan().unwrap();
        assert_eq!(scanned, vec![(blob_name("/x"), 3)]);
    }
}
