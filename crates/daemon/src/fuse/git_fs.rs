//! FUSE filesystem over the engine's dispatcher
//!
//! Implements `fuser::Filesystem` by translating each kernel request into a
//! dispatcher call. Calls block the FUSE thread on the tokio runtime; only
//! `open` and `read` of a file that is not cached locally ever wait on the
//! network.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tokio::runtime::Handle;

use common::cache::PathEntry;
use common::dispatcher::{Dispatcher, FileHandle, FsError};
use common::path;

use crate::fuse::inode_table::InodeTable;

/// Map a dispatcher error to the errno the kernel expects
pub fn errno(err: &FsError) -> libc::c_int {
    match err {
        FsError::NotFound(_) => libc::ENOENT,
        FsError::IsDirectory(_) => libc::EISDIR,
        FsError::NotDirectory(_) => libc::ENOTDIR,
        FsError::NotEmpty(_) => libc::ENOTEMPTY,
        FsError::AlreadyExists(_) => libc::EEXIST,
        FsError::BadHandle(_) => libc::EBADF,
        FsError::InvalidPath(_) => libc::EINVAL,
        FsError::Repository(_) | FsError::Io(_) => libc::EIO,
    }
}

pub struct GitFs {
    /// Tokio runtime handle for async operations
    rt: Handle,
    dispatcher: Arc<Dispatcher>,
    inodes: InodeTable,
}

impl GitFs {
    /// Default TTL for FUSE attributes
    const ATTR_TTL: Duration = Duration::from_secs(1);

    const BLOCK_SIZE: u32 = 512;

    const MAX_NAME_LEN: u32 = 255;

    pub fn new(rt: Handle, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            rt,
            dispatcher,
            inodes: InodeTable::new(),
        }
    }

    fn make_attr(inode: u64, entry: &PathEntry) -> FileAttr {
        let kind = if entry.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let mtime = UNIX_EPOCH + Duration::from_secs(entry.modified.max(0) as u64);
        let perm = if entry.is_dir() { 0o755 } else { 0o644 };

        FileAttr {
            ino: inode,
            size: entry.size,
            blocks: entry.size.div_ceil(Self::BLOCK_SIZE as u64),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: if entry.is_dir() { 2 } else { 1 },
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, libc::c_int> {
        self.inodes
            .get_path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, libc::c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let parent_path = self.path_of(parent)?;
        Ok(path::join(&parent_path, name))
    }

    /// Make sure a handle's writes are queued for the remote
    fn sync_handle(&self, fh: u64) -> Result<(), libc::c_int> {
        self.dispatcher
            .flush(FileHandle(fh))
            .map_err(|e| errno(&e))
    }

    fn entry_reply(&mut self, entry: &PathEntry, reply: ReplyEntry) {
        let inode = self.inodes.get_or_create(&entry.path);
        reply.entry(&Self::ATTR_TTL, &Self::make_attr(inode, entry), 0);
    }
}

impl Filesystem for GitFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!("FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.lookup(&path) {
            Ok(entry) => self.entry_reply(&entry, reply),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.getattr(&path) {
            Ok(entry) => reply.attr(&Self::ATTR_TTL, &Self::make_attr(ino, &entry)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        // only size changes mean anything to the remote; times and modes are
        // accepted and dropped
        if let Some(size) = size {
            if let Err(e) = self.rt.block_on(self.dispatcher.truncate(&path, size)) {
                return reply.error(errno(&e));
            }
        }

        match self.dispatcher.getattr(&path) {
            Ok(entry) => reply.attr(&Self::ATTR_TTL, &Self::make_attr(ino, &entry)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let entries = match self.dispatcher.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno(&e)),
        };

        let mut all_entries: Vec<(u64, FileType, String)> = Vec::with_capacity(entries.len() + 2);
        all_entries.push((ino, FileType::Directory, ".".to_string()));
        let parent_ino = if ino == InodeTable::ROOT_INODE {
            ino
        } else {
            self.inodes.get_or_create(&path::parent(&path))
        };
        all_entries.push((parent_ino, FileType::Directory, "..".to_string()));

        for entry in entries {
            let kind = if entry.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            let entry_ino = self.inodes.get_or_create(&entry.path);
            all_entries.push((entry_ino, kind, entry.name()));
        }

        for (i, (ino, kind, name)) in all_entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.rt.block_on(self.dispatcher.open(&path)) {
            Ok(fh) => reply.opened(fh.0, 0),
            Err(e) => {
                tracing::warn!("open of {} failed: {}", path, e);
                reply.error(errno(&e))
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        match self
            .rt
            .block_on(self.dispatcher.read(FileHandle(fh), offset, size as usize))
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        match self
            .rt
            .block_on(self.dispatcher.write(FileHandle(fh), offset, data))
        {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.sync_handle(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    // Editors fsync on save; pushing stays in the background like flush
    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.sync_handle(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.dispatcher.release(FileHandle(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let fh = match self.dispatcher.create(&path) {
            Ok(fh) => fh,
            Err(e) => return reply.error(errno(&e)),
        };
        match self.dispatcher.getattr(&path) {
            Ok(entry) => {
                let inode = self.inodes.get_or_create(&path);
                let attr = Self::make_attr(inode, &entry);
                reply.created(&Self::ATTR_TTL, &attr, 0, fh.0, flags as u32);
            }
            Err(e) => {
                let _ = self.dispatcher.release(fh);
                reply.error(errno(&e));
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.mkdir(&path) {
            Ok(entry) => self.entry_reply(&entry, reply),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.unlink(&path) {
            Ok(()) => {
                self.inodes.remove_by_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.rmdir(&path) {
            Ok(()) => {
                self.inodes.remove_by_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let to = match self.child_path(newparent, newname) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => {
                tracing::warn!("rename {} to {} failed: {}", from, to, e);
                reply.error(errno(&e))
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.dispatcher.stats();
        let block = Self::BLOCK_SIZE as u64;
        let blocks = stats.budget_bytes.div_ceil(block);
        let free = stats
            .budget_bytes
            .saturating_sub(stats.resident_bytes)
            .div_ceil(block);
        let files = (stats.files + stats.directories) as u64;
        reply.statfs(
            blocks,
            free,
            free,
            files,
            u64::MAX - files,
            Self::BLOCK_SIZE,
            Self::MAX_NAME_LEN,
            Self::BLOCK_SIZE,
        );
    }

    // Extended attributes are not stored; macOS handles ENOTSUP gracefully
    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::engine::{Engine, EngineConfig};
    use common::mirror::{MemoryMirror, MirrorError};
    use tempfile::TempDir;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno(&FsError::NotFound("/a".into())), libc::ENOENT);
        assert_eq!(errno(&FsError::IsDirectory("/a".into())), libc::EISDIR);
        assert_eq!(errno(&FsError::NotDirectory("/a".into())), libc::ENOTDIR);
        assert_eq!(errno(&FsError::NotEmpty("/a".into())), libc::ENOTEMPTY);
        assert_eq!(errno(&FsError::AlreadyExists("/a".into())), libc::EEXIST);
        assert_eq!(errno(&FsError::BadHandle(7)), libc::EBADF);
        assert_eq!(errno(&FsError::InvalidPath("/".into())), libc::EINVAL);
        assert_eq!(
            errno(&FsError::Repository(MirrorError::Unavailable("down".into()))),
            libc::EIO
        );
    }

    #[test]
    fn test_make_attr() {
        let mut entry = PathEntry::local_file("/notes.md");
        entry.size = 1025;
        entry.modified = 60;

        let attr = GitFs::make_attr(9, &entry);
        assert_eq!(attr.ino, 9);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(60));

        let dir = GitFs::make_attr(1, &PathEntry::directory("/"));
        assert_eq!(dir.kind, FileType::Directory);
        assert_eq!(dir.perm, 0o755);
    }

    #[tokio::test]
    async fn test_fsync_keeps_written_file_queued() {
        let dir = TempDir::new().unwrap();
        let (engine, _receiver) = Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryMirror::new()),
            dir.path(),
        )
        .unwrap();
        engine.restore().await.unwrap();
        let dispatcher = Arc::new(Dispatcher::new(engine.clone()));
        let fs = GitFs::new(Handle::current(), Arc::clone(&dispatcher));

        let fh = dispatcher.create("/notes.md").unwrap();
        dispatcher.write(fh, 0, b"draft").await.unwrap();

        assert_eq!(fs.sync_handle(fh.0), Ok(()));
        assert_eq!(fs.sync_handle(fh.0), Ok(()));
        assert_eq!(engine.stats().pending_changes, 1);
        assert_eq!(fs.sync_handle(fh.0 + 100), Err(libc::EBADF));
    }
}
