//! Path helpers for the virtual tree
//!
//! Every path handled by the engine is absolute, `/`-separated, and has no
//! trailing slash (except the root itself). Keys in the cache index, lanes
//! in the write-back queue and names in the remote manifest all use this
//! normalized form.

/// The root of the virtual tree
pub const ROOT: &str = "/";

/// Normalize a path to a consistent key
pub fn normalize(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == ROOT {
        return ROOT.to_string();
    }

    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        return ROOT.to_string();
    }

    format!("/{}", segments.join("/"))
}

/// Split a path into its name segments (empty for the root)
pub fn segments(path: &str) -> Vec<String> {
    normalize(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Get the parent path of a given path
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    if normalized == ROOT {
        return ROOT.to_string();
    }

    match normalized.rfind('/') {
        Some(0) | None => ROOT.to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}

/// Get the final name component of a path
pub fn file_name(path: &str) -> String {
    let normalized = normalize(path);
    if normalized == ROOT {
        return String::new();
    }

    match normalized.rfind('/') {
        Some(pos) => normalized[pos + 1..].to_string(),
        None => normalized,
    }
}

/// Join a child name onto a directory path
pub fn join(dir: &str, name: &str) -> String {
    let dir = normalize(dir);
    if dir == ROOT {
        normalize(&format!("/{}", name))
    } else {
        normalize(&format!("{}/{}", dir, name))
    }
}

/// All ancestors of a path, nearest first, excluding the path itself
/// and including the root
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = normalize(path);
    while current != ROOT {
        current = parent(&current);
        out.push(current.clone());
    }
    out
}

/// Whether `path` lies strictly below `dir`
pub fn is_descendant(path: &str, dir: &str) -> bool {
    let path = normalize(path);
    let dir = normalize(dir);
    if path == dir {
        return false;
    }
    if dir == ROOT {
        return true;
    }
    path.starts_with(&dir) && path.as_bytes().get(dir.len()) == Some(&b'/')
}

/// Rewrite a path below `from` so that it lies below `to` instead
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    let path = normalize(path);
    let from = normalize(from);
    if path == from {
        return normalize(to);
    }
    let suffix = if from == ROOT {
        &path[1..]
    } else {
        &path[from.len() + 1..]
    };
    join(to, suffix)
}

/// Files that editors and desktop shells create as scratch space.
///
/// These stay purely local: they are cached and listed like any other file,
/// but no change is ever queued for the remote.
pub fn is_scratch(path: &str) -> bool {
    let name = file_name(path);
    name.ends_with('~')
        || (name.starts_with('.') && (name.ends_with(".swp") || name.ends_with(".swx")))
        || name.starts_with("._")
        || name == ".DS_Store"
}
