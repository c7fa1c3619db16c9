//! Tests for the git-backed mirror against a local bare repository
//!
//! Skipped when no `git` binary is available.

mod support;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use common::cache::CacheState;
use common::mirror::{ContentMirror, GitMirror, GitMirrorConfig, MirrorError};
use tempfile::TempDir;

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn init_bare(dir: &Path) -> String {
    let status = std::process::Command::new("git")
        .args(["init", "--bare", "--quiet"])
        .arg(dir)
        .status()
        .unwrap();
    assert!(status.success());
    dir.to_string_lossy().to_string()
}

async fn open(temp: &TempDir, name: &str, remote: &str) -> GitMirror {
    GitMirror::open(GitMirrorConfig::new(temp.path().join(name), remote))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_git_mirror_round_trip() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let remote = init_bare(&temp.path().join("remote.git"));

    let writer = open(&temp, "writer", &remote).await;
    assert!(writer.pull_listing().await.unwrap().is_empty());

    let pushed = writer
        .push_file("/docs/a.txt", Bytes::from_static(b"hello"))
        .await
        .unwrap();
    assert_eq!(pushed.size, 5);

    // a second client sees the file through the manifest
    let reader = open(&temp, "reader", &remote).await;
    let listing = reader.pull_listing().await.unwrap();
    assert_eq!(listing.len(), 1);
    let entry = &listing["/docs/a.txt"];
    assert_eq!(entry.object_id, pushed.object_id);
    assert_eq!(reader.fetch_blob("/docs/a.txt", entry).await.unwrap(), "hello");

    let moved = writer.rename_file("/docs/a.txt", "/b.txt").await.unwrap();
    assert_eq!(moved.object_id, pushed.object_id);
    let listing = reader.pull_listing().await.unwrap();
    assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["/b.txt"]);
    assert_eq!(reader.fetch_blob("/b.txt", &listing["/b.txt"]).await.unwrap(), "hello");

    writer.remove_file("/b.txt").await.unwrap();
    assert!(reader.pull_listing().await.unwrap().is_empty());
    assert!(matches!(
        writer.remove_file("/b.txt").await,
        Err(MirrorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_missing_branch_is_not_found() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let remote = init_bare(&temp.path().join("remote.git"));
    let mirror = open(&temp, "client", &remote).await;
    mirror
        .push_file("/exists.txt", Bytes::from_static(b"x"))
        .await
        .unwrap();

    let bogus = common::mirror::RemoteEntry {
        object_id: common::mirror::ObjectId::new("0".repeat(40)),
        size: 0,
        modified: 0,
    };
    assert!(matches!(
        mirror.fetch_blob("/absent.txt", &bogus).await,
        Err(MirrorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_engine_over_git() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let remote = init_bare(&temp.path().join("remote.git"));
    let mirror = open(&temp, "engine", &remote).await;

    let (engine, receiver) = common::engine::Engine::new(
        support::config(1 << 20, 2),
        Arc::new(mirror),
        temp.path().join("blobs"),
    )
    .unwrap();
    engine.restore().await.unwrap();
    let dispatcher = common::dispatcher::Dispatcher::new(engine.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let pool = common::writeback::WorkerPool::spawn(engine.clone(), receiver, shutdown_rx);

    let fh = dispatcher.create("/notes.md").unwrap();
    dispatcher.write(fh, 0, b"# notes").await.unwrap();
    dispatcher.release(fh).unwrap();
    assert!(engine.wait_for_drain(support::DRAIN_TIMEOUT).await);
    assert_eq!(
        dispatcher.getattr("/notes.md").unwrap().state,
        CacheState::CachedClean
    );

    let other = open(&temp, "other", &remote).await;
    let listing = other.pull_listing().await.unwrap();
    let data = other
        .fetch_blob("/notes.md", &listing["/notes.md"])
        .await
        .unwrap();
    assert_eq!(data, "# notes");

    let _ = shutdown_tx.send(());
    pool.join().await;
}
