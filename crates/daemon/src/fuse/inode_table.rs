//! Inode to path mapping for the FUSE filesystem
//!
//! The kernel identifies files by inode, the engine by normalized path.
//! Inodes are handed out on first sight and stay stable across renames.

use std::collections::HashMap;

use common::path::{self, ROOT};

/// Bidirectional mapping between inodes and paths
#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl InodeTable {
    pub const ROOT_INODE: u64 = 1;

    /// Create a new inode table with the root directory at inode 1
    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table.path_to_inode.insert(ROOT.to_string(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, ROOT.to_string());
        table
    }

    /// Get inode for a path, creating one if it doesn't exist
    pub fn get_or_create(&mut self, file_path: &str) -> u64 {
        let file_path = path::normalize(file_path);
        if let Some(&ino) = self.path_to_inode.get(&file_path) {
            return ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(file_path.clone(), ino);
        self.inode_to_path.insert(ino, file_path);
        ino
    }

    pub fn get_inode(&self, file_path: &str) -> Option<u64> {
        self.path_to_inode.get(&path::normalize(file_path)).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    /// Forget a deleted path
    pub fn remove_by_path(&mut self, file_path: &str) {
        if let Some(ino) = self.path_to_inode.remove(&path::normalize(file_path)) {
            self.inode_to_path.remove(&ino);
        }
    }

    /// Move a path and everything below it, keeping inode numbers
    pub fn rename(&mut self, from: &str, to: &str) {
        let from = path::normalize(from);
        let to = path::normalize(to);

        // an inode the destination had is gone now
        self.remove_by_path(&to);

        let moved: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(p, _)| **p == from || path::is_descendant(p, &from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();

        for (old, ino) in moved {
            let new = path::rebase(&old, &from, &to);
            self.path_to_inode.remove(&old);
            self.path_to_inode.insert(new.clone(), ino);
            self.inode_to_path.insert(ino, new);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
