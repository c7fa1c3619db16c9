use std::collections::HashMap;

use crate::path;

/// Opaque handle returned by `open`/`create`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(pub u64);

#[derive(Debug, Clone)]
struct OpenFile {
    path: String,
    /// Written through this handle since it was opened
    wrote: bool,
}

/// Open handles and the paths they refer to
#[derive(Debug)]
pub struct HandleTable {
    next: u64,
    open: HashMap<u64, OpenFile>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        // 0 is left unused so a zeroed handle from the kernel never matches
        Self {
            next: 1,
            open: HashMap::new(),
        }
    }

    pub fn open(&mut self, file_path: &str, wrote: bool) -> FileHandle {
        let fh = self.next;
        self.next += 1;
        self.open.insert(
            fh,
            OpenFile {
                path: file_path.to_string(),
                wrote,
            },
        );
        FileHandle(fh)
    }

    pub fn path(&self, fh: FileHandle) -> Option<String> {
        self.open.get(&fh.0).map(|f| f.path.clone())
    }

    /// Path and write flag of a handle, without closing it
    pub fn state(&self, fh: FileHandle) -> Option<(String, bool)> {
        self.open.get(&fh.0).map(|f| (f.path.clone(), f.wrote))
    }

    pub fn mark_wrote(&mut self, fh: FileHandle) {
        if let Some(file) = self.open.get_mut(&fh.0) {
            file.wrote = true;
        }
    }

    /// Close a handle, returning its path and whether it wrote
    pub fn close(&mut self, fh: FileHandle) -> Option<(String, bool)> {
        self.open.remove(&fh.0).map(|f| (f.path, f.wrote))
    }

    /// Point handles at or below `from` to the matching path below `to`
    pub fn rebase(&mut self, from: &str, to: &str) {
        for file in self.open.values_mut() {
            if file.path == from || path::is_descendant(&file.path, from) {
                file.path = path::rebase(&file.path, from, to);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close() {
        let mut table = HandleTable::new();
        let a = table.open("/a", false);
        let b = table.open("/a", false);
        assert_ne!(a, b);
        assert_ne!(a.0, 0);

        table.mark_wrote(b);
        assert_eq!(table.close(a), Some(("/a".to_string(), false)));
        assert_eq!(table.close(b), Some(("/a".to_string(), true)));
        assert_eq!(table.close(b), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_rebase_follows_renames() {
        let mut table = HandleTable::new();
        let inner = table.open("/dir/file", false);
        let other = table.open("/dirx", false);

        table.rebase("/dir", "/moved");

        assert_eq!(table.path(inner).unwrap(), "/moved/file");
        assert_eq!(table.path(other).unwrap(), "/dirx");
    }
}
