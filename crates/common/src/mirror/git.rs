//! Git-backed content mirror
//!
//! Storage layout on the remote:
//!
//! - every file lives on its own branch, named from a hash of its path,
//!   whose tip commit holds a single `content` blob
//! - the `master` branch holds `manifest.json`, mapping each path to its
//!   branch, size and blob id
//!
//! Everything goes through git plumbing so the working tree is never
//! checked out. Fetched refs are kept under `refs/gitmount/` so they never
//! collide with anything a user might do in the mirror directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ContentMirror, Listing, MirrorError, ObjectId, RemoteEntry};
use crate::path;

const MANIFEST_BRANCH: &str = "master";
const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_REF: &str = "refs/gitmount/manifest";
const CONTENT_FILE: &str = "content";
const FETCH_REF_PREFIX: &str = "refs/gitmount/fetch";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct GitMirrorConfig {
    /// Local repository used as the working copy
    pub work_dir: PathBuf,
    /// Remote url, credentials included when required
    pub remote_url: String,
    pub author_name: String,
    pub author_email: String,
    /// Git binary to invoke
    pub git_binary: PathBuf,
}

impl GitMirrorConfig {
    pub fn new(work_dir: impl Into<PathBuf>, remote_url: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            remote_url: remote_url.into(),
            author_name: "gitmount".to_string(),
            author_email: "gitmount@localhost".to_string(),
            git_binary: PathBuf::from("git"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ManifestEntry {
    branch: String,
    size: u64,
    object_id: ObjectId,
    modified: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Manifest {
    version: u32,
    files: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            files: BTreeMap::new(),
        }
    }
}

impl Manifest {
    fn listing(&self) -> Listing {
        self.files
            .iter()
            .map(|(p, e)| {
                (
                    p.clone(),
                    RemoteEntry {
                        object_id: e.object_id.clone(),
                        size: e.size,
                        modified: e.modified,
                    },
                )
            })
            .collect()
    }
}

/// Branch that stores a path's content
pub fn branch_name(file_path: &str) -> String {
    let digest = Sha256::digest(path::normalize(file_path).as_bytes());
    format!("f-{}", &hex::encode(digest)[..40])
}

fn is_auth_failure(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("authentication failed")
        || stderr.contains("could not read username")
        || stderr.contains("invalid username or password")
        || stderr.contains("permission denied")
        || stderr.contains("error: 403")
        || stderr.contains("returned error: 401")
}

#[derive(Debug)]
pub struct GitMirror {
    config: GitMirrorConfig,
    /// Manifest as of the last pull or push
    manifest: Mutex<Manifest>,
}

impl GitMirror {
    /// Prepare the local working copy and point it at the remote
    pub async fn open(config: GitMirrorConfig) -> Result<Self, MirrorError> {
        tokio::fs::create_dir_all(&config.work_dir).await?;
        let mirror = Self {
            config,
            manifest: Mutex::new(Manifest::default()),
        };

        if !mirror.config.work_dir.join(".git").exists() {
            tracing::info!(
                "initializing mirror repository at {}",
                mirror.config.work_dir.display()
            );
            mirror.git(&["init", "--quiet"], None).await?;
        }

        let remotes = mirror.git(&["remote"], None).await?;
        let url = mirror.config.remote_url.clone();
        if remotes.lines().any(|r| r.trim() == "origin") {
            mirror.git(&["remote", "set-url", "origin", &url], None).await?;
        } else {
            mirror.git(&["remote", "add", "origin", &url], None).await?;
        }

        Ok(mirror)
    }

    async fn git(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<String, MirrorError> {
        // the remote url may carry a token, so only the subcommand is logged
        let command = format!("git {}", args.first().copied().unwrap_or_default());
        tracing::trace!("running {}", command);

        let mut cmd = Command::new(&self.config.git_binary);
        cmd.current_dir(&self.config.work_dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_AUTHOR_NAME", &self.config.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.config.author_email)
            .env("GIT_COMMITTER_NAME", &self.config.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.config.author_email)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_auth_failure(&stderr) {
                return Err(MirrorError::Auth(stderr));
            }
            return Err(MirrorError::Command {
                command,
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn git_bytes(&self, args: &[&str]) -> Result<Bytes, MirrorError> {
        let output = Command::new(&self.config.git_binary)
            .current_dir(&self.config.work_dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(MirrorError::Command {
                command: format!("git {}", args.first().copied().unwrap_or_default()),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(Bytes::from(output.stdout))
    }

    /// Write a blob into the object store and wrap it in a one-file commit
    async fn commit_single(
        &self,
        name: &str,
        data: &[u8],
        parent: Option<&str>,
        message: &str,
    ) -> Result<(String, String), MirrorError> {
        let blob = self
            .git(&["hash-object", "-w", "--stdin"], Some(data))
            .await?;
        let tree_line = format!("100644 blob {}\t{}\n", blob, name);
        let tree = self.git(&["mktree"], Some(tree_line.as_bytes())).await?;

        let mut args = vec!["commit-tree", tree.as_str(), "-m", message];
        if let Some(parent) = parent {
            args.push("-p");
            args.push(parent);
        }
        let commit = self.git(&args, None).await?;
        Ok((blob, commit))
    }

    async fn local_ref(&self, name: &str) -> Option<String> {
        self.git(&["rev-parse", "--verify", "--quiet", name], None)
            .await
            .ok()
            .filter(|s| !s.is_empty())
    }

    /// Commit the manifest on top of the last known manifest commit and push it
    async fn publish_manifest(&self, manifest: &Manifest, message: &str) -> Result<(), MirrorError> {
        let json = serde_json::to_vec_pretty(manifest)?;
        let parent = self.local_ref(MANIFEST_REF).await;
        let (_, commit) = self
            .commit_single(MANIFEST_FILE, &json, parent.as_deref(), message)
            .await?;

        let refspec = format!("+{}:refs/heads/{}", commit, MANIFEST_BRANCH);
        self.git(&["push", "--quiet", "origin", &refspec], None)
            .await?;
        self.git(&["update-ref", MANIFEST_REF, &commit], None).await?;

        *self.manifest.lock() = manifest.clone();
        Ok(())
    }

    async fn fetch_branch(&self, branch: &str) -> Result<String, MirrorError> {
        let local = format!("{}/{}", FETCH_REF_PREFIX, branch);
        let refspec = format!("+refs/heads/{}:{}", branch, local);
        self.git(
            &["fetch", "--quiet", "--no-write-fetch-head", "origin", &refspec],
            None,
        )
        .await
        .map_err(|e| match e {
            MirrorError::Command { stderr, .. } if stderr.contains("couldn't find remote ref") => {
                MirrorError::NotFound(branch.to_string())
            }
            other => other,
        })?;
        Ok(local)
    }
}

#[async_trait]
impl ContentMirror for GitMirror {
    async fn pull_listing(&self) -> Result<Listing, MirrorError> {
        let heads = self
            .git(&["ls-remote", "--heads", "origin", MANIFEST_BRANCH], None)
            .await?;
        if heads.is_empty() {
            tracing::info!("remote has no manifest yet, starting empty");
            let manifest = Manifest::default();
            let listing = manifest.listing();
            *self.manifest.lock() = manifest;
            return Ok(listing);
        }

        let refspec = format!("+refs/heads/{}:{}", MANIFEST_BRANCH, MANIFEST_REF);
        self.git(
            &["fetch", "--quiet", "--no-write-fetch-head", "origin", &refspec],
            None,
        )
        .await?;
        let raw = self
            .git_bytes(&["show", &format!("{}:{}", MANIFEST_REF, MANIFEST_FILE)])
            .await?;
        let manifest: Manifest = serde_json::from_slice(&raw)?;
        tracing::debug!("pulled manifest with {} files", manifest.files.len());

        let listing = manifest.listing();
        *self.manifest.lock() = manifest;
        Ok(listing)
    }

    async fn fetch_blob(&self, file_path: &str, entry: &RemoteEntry) -> Result<Bytes, MirrorError> {
        // objects already in the local store need no network round trip
        if let Ok(data) = self
            .git_bytes(&["cat-file", "blob", entry.object_id.as_str()])
            .await
        {
            return Ok(data);
        }

        let branch = branch_name(file_path);
        let local = self.fetch_branch(&branch).await?;
        let data = self
            .git_bytes(&["cat-file", "blob", &format!("{}:{}", local, CONTENT_FILE)])
            .await?;
        tracing::debug!("fetched {} ({} bytes)", file_path, data.len());
        Ok(data)
    }

    async fn push_file(&self, file_path: &str, data: Bytes) -> Result<RemoteEntry, MirrorError> {
        let file_path = path::normalize(file_path);
        let branch = branch_name(&file_path);
        let (blob, commit) = self
            .commit_single(CONTENT_FILE, &data, None, &format!("write {}", file_path))
            .await?;

        let refspec = format!("+{}:refs/heads/{}", commit, branch);
        self.git(&["push", "--quiet", "origin", &refspec], None)
            .await?;

        let entry = ManifestEntry {
            branch,
            size: data.len() as u64,
            object_id: ObjectId::new(blob),
            modified: chrono::Utc::now().timestamp(),
        };
        let mut manifest = self.manifest.lock().clone();
        manifest.files.insert(file_path.clone(), entry.clone());
        self.publish_manifest(&manifest, &format!("write {}", file_path))
            .await?;

        Ok(RemoteEntry {
            object_id: entry.object_id,
            size: entry.size,
            modified: entry.modified,
        })
    }

    async fn remove_file(&self, file_path: &str) -> Result<(), MirrorError> {
        let file_path = path::normalize(file_path);
        let mut manifest = self.manifest.lock().clone();
        let entry = manifest
            .files
            .remove(&file_path)
            .ok_or_else(|| MirrorError::NotFound(file_path.clone()))?;

        let refspec = format!(":refs/heads/{}", entry.branch);
        self.git(&["push", "--quiet", "origin", &refspec], None)
            .await?;
        self.publish_manifest(&manifest, &format!("delete {}", file_path))
            .await
    }

    async fn rename_file(&self, from: &str, to: &str) -> Result<RemoteEntry, MirrorError> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        let mut manifest = self.manifest.lock().clone();
        let mut entry = manifest
            .files
            .remove(&from)
            .ok_or_else(|| MirrorError::NotFound(from.clone()))?;

        let local = self.fetch_branch(&entry.branch).await?;
        let new_branch = branch_name(&to);
        let create = format!("+{}:refs/heads/{}", local, new_branch);
        let delete = format!(":refs/heads/{}", entry.branch);
        // an existing destination branch is overwritten
        self.git(&["push", "--quiet", "origin", &create, &delete], None)
            .await?;

        entry.branch = new_branch;
        entry.modified = chrono::Utc::now().timestamp();
        manifest.files.insert(to.clone(), entry.clone());
        self.publish_manifest(&manifest, &format!("rename {} to {}", from, to))
            .await?;

        Ok(RemoteEntry {
            object_id: entry.object_id,
            size: entry.size,
            modified: entry.modified,
        })
    }
}
