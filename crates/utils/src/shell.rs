//! Cross-platform executable lookup utilities

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::OsStr,
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Resolve an executable by name.
///
/// The search order is:
/// 1. Explicit paths (absolute or containing a separator).
/// 2. The current process PATH via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    which(executable).await
}

/// Merge two PATH strings into a single, de-duplicated PATH.
///
/// - Keeps the order of entries from `primary`.
/// - Appends only *unseen* entries from `secondary`.
/// - Ignores empty components.
/// - Returns a platform-correct PATH string (using the OS separator).
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn which(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(|result| result.ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_paths_dedupes_and_keeps_primary_order() {
        let sep = if cfg!(windows) { ";" } else { ":" };
        let primary = format!("{0}a{1}{0}b", std::path::MAIN_SEPARATOR, sep);
        let secondary = format!("{0}b{1}{0}c", std::path::MAIN_SEPARATOR, sep);
        let merged = merge_paths(&primary, &secondary);
        let parts: Vec<PathBuf> = split_paths(&merged).collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].ends_with("a"));
        assert!(parts[1].ends_with("b"));
        assert!(parts[2].ends_with("c"));
    }

    #[tokio::test]
    async fn empty_name_resolves_to_none() {
        assert_eq!(resolve_executable_path("  ").await, None);
    }
}
