use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, StoreError};

/// Directory under the principal repository root that holds the store.
pub const STORE_DIR: &str = ".opencode";

/// Default database file name inside [`STORE_DIR`].
pub const DEFAULT_DB_NAME: &str = "swarm.db";

/// True when `path` is a linked working tree, i.e. its `.git` entry is a
/// pointer file rather than a directory.
pub fn is_worktree(path: &Path) -> bool {
    path.join(".git").is_file()
}

/// Resolve any path inside a repository (principal or linked worktree) to the
/// principal repository root.
///
/// Resolution walks up to the nearest ancestor that has a `.git` entry:
/// - `.git` directory: that ancestor is the principal root
/// - `.git` file: parse its `gitdir: <path>` pointer and step three levels up
///   from the pointed-to directory (`<root>/.git/worktrees/<name>`)
/// - no `.git` anywhere: the input path itself
pub fn main_repo_root(path: &Path) -> Result<PathBuf> {
    let Some(repo_dir) = nearest_git_ancestor(path) else {
        return Ok(path.to_path_buf());
    };

    let marker = repo_dir.join(".git");
    if marker.is_dir() {
        return Ok(repo_dir);
    }

    let content = fs::read_to_string(&marker)?;
    let gitdir = parse_gitdir_pointer(&content).ok_or_else(|| StoreError::PathResolution {
        path: marker.clone(),
        reason: "expected a 'gitdir: <path>' line".into(),
    })?;

    let pointed = if Path::new(gitdir).is_absolute() {
        PathBuf::from(gitdir)
    } else {
        lexical_clean(&repo_dir.join(gitdir))
    };

    pointed
        .ancestors()
        .nth(3)
        .map(Path::to_path_buf)
        .filter(|root| !root.as_os_str().is_empty())
        .ok_or_else(|| StoreError::PathResolution {
            path: marker,
            reason: format!("gitdir '{gitdir}' is too shallow to locate the principal root"),
        })
}

/// `<principal-root>/.opencode/<filename>` for any path in the repository.
pub fn resolve_db_path(path: &Path, filename: &str) -> Result<PathBuf> {
    Ok(main_repo_root(path)?.join(STORE_DIR).join(filename))
}

/// Collapse `.` and `..` components without touching the filesystem, so a
/// relative pointer yields the same bytes as the principal checkout path.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn nearest_git_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Parse the `key: value` lines of a `.git` pointer file and return the
/// `gitdir` value.
fn parse_gitdir_pointer(content: &str) -> Option<&str> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let value = value.trim();
        (key.trim() == "gitdir" && !value.is_empty()).then_some(value)
    })
}
