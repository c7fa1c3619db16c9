//! Integration tests for directory operations and renames

mod support;

use common::dispatcher::FsError;
use common::mirror::MemoryMirror;

#[tokio::test]
async fn test_mkdir_and_rmdir() {
    let env = support::setup(support::config(1 << 20, 1)).await;

    env.dispatcher.mkdir("/docs").unwrap();
    env.write_file("/docs/a.txt", b"a").await;
    assert_eq!(env.names("/docs"), vec!["a.txt"]);

    assert!(matches!(
        env.dispatcher.mkdir("/docs"),
        Err(FsError::AlreadyExists(_))
    ));
    assert!(matches!(
        env.dispatcher.mkdir("/missing/inner"),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        env.dispatcher.rmdir("/docs"),
        Err(FsError::NotEmpty(_))
    ));

    env.dispatcher.unlink("/docs/a.txt").unwrap();
    env.dispatcher.rmdir("/docs").unwrap();
    assert!(env.names("/").is_empty());
}

#[tokio::test]
async fn test_type_mismatches() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/file.txt", "x");
    mirror.put_remote("/dir/inner.txt", "y");
    let env = support::setup_with(mirror, support::config(1 << 20, 1)).await;

    assert!(matches!(
        env.dispatcher.create("/file.txt/child"),
        Err(FsError::NotDirectory(_))
    ));
    assert!(matches!(
        env.dispatcher.readdir("/file.txt"),
        Err(FsError::NotDirectory(_))
    ));
    assert!(matches!(
        env.dispatcher.unlink("/dir"),
        Err(FsError::IsDirectory(_))
    ));
    assert!(matches!(
        env.dispatcher.rmdir("/file.txt"),
        Err(FsError::NotDirectory(_))
    ));
    assert!(matches!(
        env.dispatcher.create("/file.txt"),
        Err(FsError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_listing_builds_directories() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/README.md", "readme");
    mirror.put_remote("/src/main.rs", "fn main() {}");
    mirror.put_remote("/src/util/mod.rs", "");
    let env = support::setup_with(mirror, support::config(1 << 20, 1)).await;

    assert_eq!(env.names("/"), vec!["README.md", "src"]);
    assert_eq!(env.names("/src"), vec!["main.rs", "util"]);
    assert!(env.dispatcher.getattr("/src/util").unwrap().is_dir());

    let main = env.dispatcher.getattr("/src/main.rs").unwrap();
    assert_eq!(main.size, 12);
    assert!(main.object_id.is_some());
}

#[tokio::test]
async fn test_rename_directory() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/src/main.rs", "main");
    mirror.put_remote("/src/lib/mod.rs", "lib");
    let mut env = support::setup_with(mirror, support::config(1 << 20, 2)).await;

    env.dispatcher.rename("/src", "/code").unwrap();

    assert_eq!(env.names("/"), vec!["code"]);
    assert_eq!(env.names("/code"), vec!["lib", "main.rs"]);
    assert!(env.dispatcher.getattr("/src/main.rs").is_err());
    assert_eq!(env.read_string("/code/lib/mod.rs").await, "lib");

    env.start_pool();
    env.drain().await;

    let mut ops = env.mirror.operations();
    ops.sort();
    assert_eq!(
        ops,
        vec![
            "rename /src/lib/mod.rs -> /code/lib/mod.rs",
            "rename /src/main.rs -> /code/main.rs",
        ]
    );
    assert_eq!(env.mirror.remote_content("/code/main.rs").unwrap(), "main");
    assert!(env.mirror.remote_content("/src/main.rs").is_none());
    env.shutdown().await;
}

#[tokio::test]
async fn test_rename_replaces_destination() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/a", "from a");
    mirror.put_remote("/b", "from b");
    let mut env = support::setup_with(mirror, support::config(1 << 20, 1)).await;

    env.dispatcher.rename("/a", "/b").unwrap();
    assert_eq!(env.names("/"), vec!["b"]);
    assert_eq!(env.read_string("/b").await, "from a");

    env.start_pool();
    env.drain().await;

    assert_eq!(env.mirror.operations(), vec!["rename /a -> /b"]);
    assert_eq!(env.mirror.remote_content("/b").unwrap(), "from a");
    assert!(env.mirror.remote_content("/a").is_none());
    env.shutdown().await;
}

#[tokio::test]
async fn test_open_handle_follows_rename() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/a.txt", "contents");
    let env = support::setup_with(mirror, support::config(1 << 20, 1)).await;

    let fh = env.dispatcher.open("/a.txt").await.unwrap();
    env.dispatcher.rename("/a.txt", "/c.txt").unwrap();

    assert_eq!(env.dispatcher.read(fh, 0, 64).await.unwrap(), "contents");
    env.dispatcher.release(fh).unwrap();
    assert_eq!(env.dispatcher.open_handles(), 0);
}

#[tokio::test]
async fn test_invalid_renames() {
    let env = support::setup(support::config(1 << 20, 1)).await;
    env.dispatcher.mkdir("/dir").unwrap();
    env.dispatcher.mkdir("/dir/sub").unwrap();

    assert!(matches!(
        env.dispatcher.rename("/", "/x"),
        Err(FsError::InvalidPath(_))
    ));
    assert!(matches!(
        env.dispatcher.rename("/dir", "/dir/sub/deeper"),
        Err(FsError::InvalidPath(_))
    ));
    assert!(matches!(
        env.dispatcher.rename("/nope", "/x"),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        env.dispatcher.rename("/dir", "/missing/dir"),
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_truncate() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/log.txt", "Hello, world");
    let mut env = support::setup_with(mirror, support::config(1 << 20, 1)).await;

    env.dispatcher.truncate("/log.txt", 5).await.unwrap();
    assert_eq!(env.read_string("/log.txt").await, "Hello");
    assert_eq!(env.dispatcher.getattr("/log.txt").unwrap().size, 5);

    env.start_pool();
    env.drain().await;
    assert_eq!(env.mirror.remote_content("/log.txt").unwrap(), "Hello");
    env.shutdown().await;
}
