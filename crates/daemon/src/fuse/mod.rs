//! FUSE mount of the engine's virtual tree

pub mod git_fs;
pub mod inode_table;

use std::path::Path;
use std::sync::Arc;

use common::dispatcher::Dispatcher;

pub use git_fs::GitFs;
pub use inode_table::InodeTable;

/// Mount the dispatcher at `mount_point` in a background FUSE session
///
/// The filesystem stays mounted until the returned session is dropped.
pub fn mount(
    dispatcher: Arc<Dispatcher>,
    mount_point: &Path,
) -> std::io::Result<fuser::BackgroundSession> {
    let fs = GitFs::new(tokio::runtime::Handle::current(), dispatcher);

    #[cfg(target_os = "macos")]
    let options = vec![
        fuser::MountOption::FSName("gitmount".to_string()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::CUSTOM("volname=gitmount".to_string()),
        fuser::MountOption::CUSTOM("noappledouble".to_string()),
    ];

    #[cfg(not(target_os = "macos"))]
    let options = vec![
        fuser::MountOption::FSName("gitmount".to_string()),
        fuser::MountOption::AutoUnmount,
    ];

    tracing::info!("mounting FUSE filesystem at {:?}", mount_point);
    fuser::spawn_mount2(fs, mount_point, &options)
}
