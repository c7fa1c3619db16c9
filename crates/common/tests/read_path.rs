//! Integration tests for reads, fetch-on-miss and eviction

mod support;

use std::sync::Arc;
use std::time::Duration;

use common::cache::CacheState;
use common::dispatcher::FsError;
use common::mirror::MemoryMirror;

fn state(env: &support::TestEnv, path: &str) -> CacheState {
    env.dispatcher.getattr(path).unwrap().state
}

#[tokio::test]
async fn test_lru_eviction_before_new_blob_lands() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/one", "aaaaaa");
    mirror.put_remote("/two", "bbbbbb");
    mirror.put_remote("/three", "cccccc");
    let env = support::setup_with(mirror, support::config(10, 1)).await;

    assert_eq!(env.read_string("/one").await, "aaaaaa");
    assert_eq!(env.read_string("/two").await, "bbbbbb");
    assert_eq!(env.engine.stats().resident_bytes, 12);

    assert_eq!(env.read_string("/three").await, "cccccc");

    assert_eq!(state(&env, "/one"), CacheState::RemoteOnly);
    assert_eq!(state(&env, "/two"), CacheState::CachedClean);
    assert_eq!(state(&env, "/three"), CacheState::CachedClean);
    assert_eq!(env.engine.stats().resident_bytes, 12);
    assert!(!env.engine.blobs().exists("/one"));
}

#[tokio::test]
async fn test_recent_access_protects_from_eviction() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/one", "aaaaaa");
    mirror.put_remote("/two", "bbbbbb");
    mirror.put_remote("/three", "cccccc");
    let env = support::setup_with(mirror, support::config(10, 1)).await;

    env.read_string("/one").await;
    env.read_string("/two").await;
    // touching /one makes /two the least recently used
    env.read_string("/one").await;
    env.read_string("/three").await;

    assert_eq!(state(&env, "/one"), CacheState::CachedClean);
    assert_eq!(state(&env, "/two"), CacheState::RemoteOnly);
}

#[tokio::test]
async fn test_open_handle_blocks_eviction() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/one", "aaaaaa");
    mirror.put_remote("/two", "bbbbbb");
    mirror.put_remote("/three", "cccccc");
    let env = support::setup_with(mirror, support::config(10, 1)).await;

    let held = env.dispatcher.open("/one").await.unwrap();
    env.read_string("/two").await;
    env.read_string("/three").await;

    assert_eq!(state(&env, "/one"), CacheState::CachedClean);
    assert_eq!(state(&env, "/two"), CacheState::RemoteOnly);
    let data = env.dispatcher.read(held, 0, 3).await.unwrap();
    assert_eq!(data, "aaa");
    env.dispatcher.release(held).unwrap();
}

#[tokio::test]
async fn test_dirty_entries_exceed_budget() {
    let env = support::setup(support::config(4, 1)).await;

    env.write_file("/big.txt", b"more than four bytes").await;
    env.write_file("/other.txt", b"also large").await;

    let stats = env.engine.stats();
    assert_eq!(stats.resident_bytes, 30);
    assert_eq!(stats.cached_dirty, 2);
    assert_eq!(env.read_string("/big.txt").await, "more than four bytes");
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/shared.bin", "payload");
    mirror.set_fetch_delay(Duration::from_millis(50));
    let env = support::setup_with(mirror.clone(), support::config(1024, 1)).await;

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let dispatcher = Arc::clone(&env.dispatcher);
        tasks.push(tokio::spawn(async move {
            dispatcher.read_file("/shared.bin").await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), "payload");
    }

    assert_eq!(mirror.fetch_count(), 1);
}

#[tokio::test]
async fn test_read_ranges() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/docs/readme.md", "0123456789");
    let env = support::setup_with(mirror, support::config(1024, 1)).await;

    let fh = env.dispatcher.open("/docs/readme.md").await.unwrap();
    assert_eq!(env.dispatcher.read(fh, 2, 3).await.unwrap(), "234");
    assert_eq!(env.dispatcher.read(fh, 8, 10).await.unwrap(), "89");
    assert!(env.dispatcher.read(fh, 20, 4).await.unwrap().is_empty());
    env.dispatcher.release(fh).unwrap();
}

#[tokio::test]
async fn test_fetch_failure_surfaces_to_caller() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/a.txt", "data");
    let env = support::setup_with(mirror.clone(), support::config(1024, 1)).await;
    mirror.set_offline(true);

    let result = env.dispatcher.open("/a.txt").await;
    assert!(matches!(result, Err(FsError::Repository(_))));
    assert_eq!(state(&env, "/a.txt"), CacheState::RemoteOnly);
    assert_eq!(env.dispatcher.getattr("/a.txt").unwrap().open_handles, 0);

    mirror.set_offline(false);
    assert_eq!(env.read_string("/a.txt").await, "data");
}

#[tokio::test]
async fn test_missing_paths() {
    let env = support::setup(support::config(1024, 1)).await;

    assert!(matches!(
        env.dispatcher.getattr("/nope"),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        env.dispatcher.open("/nope").await,
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        env.dispatcher.open("/").await,
        Err(FsError::IsDirectory(_))
    ));
}

#[tokio::test]
async fn test_lookup_matches_getattr() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/docs/a.md", "abc");
    let env = support::setup_with(mirror, support::config(1024, 1)).await;

    let looked_up = env.dispatcher.lookup("docs/a.md").unwrap();
    let attr = env.dispatcher.getattr("/docs/a.md").unwrap();
    assert_eq!(looked_up.path, "/docs/a.md");
    assert_eq!(looked_up.size, attr.size);
    assert_eq!(looked_up.state, attr.state);
    assert!(matches!(
        env.dispatcher.lookup("/docs/missing.md"),
        Err(FsError::NotFound(p)) if p == "/docs/missing.md"
    ));
}

#[tokio::test]
async fn test_truncate_during_fetch_keeps_local_content() {
    let mirror = MemoryMirror::new();
    mirror.put_remote("/f.txt", "remote content");
    mirror.set_fetch_delay(Duration::from_millis(200));
    let mut env = support::setup_with(mirror, support::config(1024, 1)).await;

    let reader = {
        let dispatcher = Arc::clone(&env.dispatcher);
        tokio::spawn(async move { dispatcher.read_file("/f.txt").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    env.dispatcher.truncate("/f.txt", 0).await.unwrap();
    reader.await.unwrap().unwrap();

    let entry = env.dispatcher.getattr("/f.txt").unwrap();
    assert_eq!(entry.state, CacheState::CachedDirty);
    assert_eq!(entry.size, 0);
    assert!(env.engine.blobs().read_all("/f.txt").unwrap().is_empty());
    assert_eq!(env.engine.stats().resident_bytes, 0);

    env.start_pool();
    env.drain().await;
    assert!(env.mirror.remote_content("/f.txt").unwrap().is_empty());
    env.shutdown().await;
}
