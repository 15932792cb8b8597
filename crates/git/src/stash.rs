//! Desktop-managed stash entries.
//!
//! The application only ever surfaces stash entries it created itself,
//! identified by a magic marker in the stash message that also records
//! which branch the entry belongs to. Entries created outside the
//! application are counted but never listed, dropped or popped.

use std::{path::Path, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    delimited::{log_format_args, parse_log_records},
    errors::GitErrorKind,
    exec::{ExecOptions, GitError, GitExecutor},
    log::parse_raw_log_with_numstat,
    status::CommittedFileChange,
};

pub const DESKTOP_STASH_ENTRY_MARKER: &str = "!!GitHub_Desktop";

// The marker trails the message: `!!GitHub_Desktop<branch>`. Branch
// names may contain anything but NUL, hence the greedy group.
static STASH_MESSAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!!GitHub_Desktop<(.+)>$").unwrap_or_else(|e| panic!("stash marker matcher: {e}"))
});

static ERROR_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^error: ").unwrap_or_else(|e| panic!("error line matcher: {e}")));

/// A stash entry created by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StashEntry {
    /// The selector of the entry in the stash reflog, e.g. `stash@{0}`.
    pub name: String,
    /// SHA of the commit object backing the entry.
    pub stash_sha: String,
    /// The branch the entry was created on, from the marker.
    pub branch_name: String,
    /// SHA of the commit's tree, needed to recreate the entry when
    /// moving it between branches.
    pub tree: String,
    pub parents: Vec<String>,
}

/// The outcome of listing the stash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StashResult {
    /// Entries created by the application, in reflog (LIFO) order.
    pub desktop_entries: Vec<StashEntry>,
    /// Total number of stash entries, whoever created them.
    pub stash_entry_count: usize,
}

/// The stash message that marks an entry as application-created on the
/// given branch.
pub fn create_desktop_stash_message(branch_name: &str) -> String {
    format!("{DESKTOP_STASH_ENTRY_MARKER}<{branch_name}>")
}

fn extract_branch_from_message(message: &str) -> Option<String> {
    STASH_MESSAGE_RE
        .captures(message)
        .map(|c| c[1].to_string())
        .filter(|branch| !branch.is_empty())
}

/// List the stash reflog, in its default LIFO order. A missing
/// `refs/stash` reflog (or no repository at all) yields an empty
/// result.
pub async fn get_stashes(executor: &GitExecutor, path: &Path) -> Result<StashResult, GitError> {
    let fields = ["%gD", "%H", "%gs", "%T", "%P"];

    let mut args = vec!["log".to_string(), "-g".to_string()];
    args.extend(log_format_args(&fields));
    args.push("refs/stash".to_string());
    args.push("--".to_string());

    let result = executor
        .git(
            args,
            path,
            "get_stashes",
            ExecOptions {
                success_exit_codes: vec![0, 128],
                ..Default::default()
            },
        )
        .await?;

    if result.exit_code == 128 {
        return Ok(StashResult {
            desktop_entries: Vec::new(),
            stash_entry_count: 0,
        });
    }

    let records = parse_log_records(&result.stdout_str(), fields.len())?;
    let stash_entry_count = records.len();

    let mut desktop_entries = Vec::new();
    for record in records {
        let [name, stash_sha, message, tree, parents] = <[String; 5]>::try_from(record)
            .map_err(|record: Vec<String>| {
                GitError::Malformed(format!("stash record had {} fields", record.len()))
            })?;

        if let Some(branch_name) = extract_branch_from_message(&message) {
            desktop_entries.push(StashEntry {
                name,
                stash_sha,
                branch_name,
                tree,
                parents: if parents.is_empty() {
                    Vec::new()
                } else {
                    parents.split(' ').map(String::from).collect()
                },
            });
        }
    }

    Ok(StashResult {
        desktop_entries,
        stash_entry_count,
    })
}

/// The most recent application-created stash entry for the given
/// branch. The reflog is LIFO, so the first match is the latest.
pub async fn get_last_desktop_stash_entry_for_branch(
    executor: &GitExecutor,
    path: &Path,
    branch_name: &str,
) -> Result<Option<StashEntry>, GitError> {
    let stash = get_stashes(executor, path).await?;
    Ok(stash
        .desktop_entries
        .into_iter()
        .find(|entry| entry.branch_name == branch_name))
}

async fn get_stash_entry_matching_sha(
    executor: &GitExecutor,
    path: &Path,
    stash_sha: &str,
) -> Result<Option<StashEntry>, GitError> {
    let stash = get_stashes(executor, path).await?;
    Ok(stash
        .desktop_entries
        .into_iter()
        .find(|entry| entry.stash_sha == stash_sha))
}

/// Stash the working directory changes for the current branch with the
/// application marker. Returns false when there was nothing to save.
///
/// Untracked files are staged first so `stash push` picks them up
/// without `--include-untracked` side effects.
pub async fn create_desktop_stash_entry(
    executor: &GitExecutor,
    path: &Path,
    branch_name: &str,
    untracked_paths: &[String],
) -> Result<bool, GitError> {
    if !untracked_paths.is_empty() {
        // Pathspecs over stdin so a large untracked set can't blow the
        // command-line length limit.
        executor
            .git(
                ["add", "--pathspec-from-file=-", "--pathspec-file-nul"],
                path,
                "create_desktop_stash_entry",
                ExecOptions {
                    stdin: Some(untracked_paths.join("\0").into_bytes()),
                    ..Default::default()
                },
            )
            .await?;
    }

    let message = create_desktop_stash_message(branch_name);
    let args = ["stash", "push", "-m", message.as_str()];

    let result = match executor
        .git(args, path, "create_desktop_stash_entry", ExecOptions::default())
        .await
    {
        Ok(result) => result,
        // `git stash push` can exit with 1 after creating a perfectly
        // valid stash, e.g. when a file is missing from disk during the
        // working directory reset. Only lines starting with `error:`
        // indicate that no stash was created.
        Err(GitError::Command(cmd))
            if cmd.result.exit_code == 1 && !ERROR_LINE_RE.is_match(&cmd.result.stderr_str()) =>
        {
            tracing::info!(
                "a stash was created successfully but exit code {} reported. stderr: {}",
                cmd.result.exit_code,
                cmd.result.stderr_str()
            );
            cmd.result
        }
        Err(e) => return Err(e),
    };

    // Not an error as far as stash is concerned, but the caller needs
    // to know no entry was created.
    Ok(result.stdout_str() != "No local changes to save\n")
}

/// Drop the application-created stash entry with the given SHA, if it
/// still exists. Addressing by SHA rather than `stash@{n}` makes this
/// safe against concurrent reflog shifts.
pub async fn drop_desktop_stash_entry(
    executor: &GitExecutor,
    path: &Path,
    stash_sha: &str,
) -> Result<(), GitError> {
    if let Some(entry) = get_stash_entry_matching_sha(executor, path, stash_sha).await? {
        executor
            .git(
                ["stash", "drop", entry.name.as_str()],
                path,
                "drop_desktop_stash_entry",
                ExecOptions::default(),
            )
            .await?;
    }

    Ok(())
}

/// Pop the application-created stash entry with the given SHA, if it
/// still exists.
pub async fn pop_stash_entry(
    executor: &GitExecutor,
    path: &Path,
    stash_sha: &str,
) -> Result<(), GitError> {
    let Some(entry) = get_stash_entry_matching_sha(executor, path, stash_sha).await? else {
        return Ok(());
    };

    let pop = executor
        .git(
            ["stash", "pop", "--quiet", entry.name.as_str()],
            path,
            "pop_stash_entry",
            ExecOptions {
                // Conflict handling is the caller's business.
                expected_errors: vec![GitErrorKind::MergeConflicts],
                ..Default::default()
            },
        )
        .await;

    match pop {
        Ok(_) => Ok(()),
        // A pop that conflicts in the working directory exits with 1
        // and leaves the entry in the stash even though it was applied.
        // Empty stderr distinguishes that from a pop that failed
        // outright, so finish the job by dropping the entry ourselves.
        Err(GitError::Command(cmd))
            if cmd.result.exit_code == 1 && cmd.result.stderr.is_empty() =>
        {
            tracing::info!(
                "a stash was popped successfully but exit code {} reported",
                cmd.result.exit_code
            );
            drop_desktop_stash_entry(executor, path, stash_sha).await
        }
        Err(e) => Err(e),
    }
}

/// Recreate a stash entry's commit with a message naming a different
/// branch, store it, and drop the original. The working directory is
/// never touched.
pub async fn move_stash_entry(
    executor: &GitExecutor,
    path: &Path,
    entry: &StashEntry,
    branch_name: &str,
) -> Result<(), GitError> {
    let message = format!(
        "On {branch_name}: {}",
        create_desktop_stash_message(branch_name)
    );

    let mut args = vec!["commit-tree".to_string()];
    for parent in &entry.parents {
        args.push("-p".to_string());
        args.push(parent.clone());
    }
    args.push("-m".to_string());
    args.push(message.clone());
    args.push("--no-gpg-sign".to_string());
    args.push(entry.tree.clone());

    let result = executor
        .git(args, path, "move_stash_entry", ExecOptions::default())
        .await?;
    let commit_id = result.stdout_str().trim().to_string();

    executor
        .git(
            ["stash", "store", "-m", message.as_str(), commit_id.as_str()],
            path,
            "move_stash_entry",
            ExecOptions::default(),
        )
        .await?;

    drop_desktop_stash_entry(executor, path, &entry.stash_sha).await
}

/// The files changed in the given stash commit.
pub async fn get_stashed_files(
    executor: &GitExecutor,
    path: &Path,
    stash_sha: &str,
) -> Result<Vec<CommittedFileChange>, GitError> {
    let args = [
        "stash",
        "show",
        stash_sha,
        "--raw",
        "--numstat",
        "-z",
        "--format=format:",
        "--no-show-signature",
        "--",
    ];

    let result = executor
        .git(args, path, "get_stashed_files", ExecOptions::default())
        .await?;

    let changeset =
        parse_raw_log_with_numstat(&result.stdout_str(), stash_sha, &format!("{stash_sha}^"))?;
    Ok(changeset.files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_message_round_trips() {
        let message = create_desktop_stash_message("feature/fix-all-the-things");
        assert_eq!(
            extract_branch_from_message(&message).as_deref(),
            Some("feature/fix-all-the-things")
        );
    }

    #[test]
    fn branch_names_with_commas_and_angle_brackets_survive() {
        let message = create_desktop_stash_message("odd,na<me");
        assert_eq!(
            extract_branch_from_message(&message).as_deref(),
            Some("odd,na<me")
        );
    }

    #[test]
    fn foreign_messages_are_not_desktop_entries() {
        assert_eq!(extract_branch_from_message("WIP on main: 1234567 stuff"), None);
        assert_eq!(extract_branch_from_message("!!GitHub_Desktop<>"), None);
        assert_eq!(extract_branch_from_message(""), None);
    }

    #[test]
    fn marker_must_be_at_end_of_message() {
        assert_eq!(
            extract_branch_from_message("!!GitHub_Desktop<main> trailing"),
            None
        );
    }
}
