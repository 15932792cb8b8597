//! Commit history: `git log` and the models it produces.

use std::{path::Path, sync::LazyLock};

use chrono::{DateTime, FixedOffset, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    delimited::{log_format_args, parse_log_records},
    exec::{ExecOptions, GitError, GitExecutor},
    status::{CommittedFileChange, map_status},
};

// Commit summaries and bodies are user-controlled and unbounded; a
// pathological commit should not balloon every history fetch.
const MAX_MESSAGE_BYTES: usize = 100 * 1024;

/// An author or committer identity in the `GIT_AUTHOR_IDENT` shape,
/// i.e. `name <email> epoch offset` with `--date=raw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
    pub date: DateTime<FixedOffset>,
}

static IDENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?) <(.*?)> (\d+) ([+-])?(\d{2})(\d{2})")
        .unwrap_or_else(|e| panic!("identity matcher: {e}"))
});

impl CommitIdentity {
    pub fn parse(identity: &str) -> Result<Self, GitError> {
        let malformed = || GitError::Malformed(format!("could not parse identity {identity:?}"));

        let captures = IDENTITY_RE.captures(identity).ok_or_else(malformed)?;
        let epoch: i64 = captures[3].parse().map_err(|_| malformed())?;
        let sign: i32 = if captures.get(4).map(|m| m.as_str()) == Some("-") {
            -1
        } else {
            1
        };
        let hours: i32 = captures[5].parse().map_err(|_| malformed())?;
        let minutes: i32 = captures[6].parse().map_err(|_| malformed())?;

        let offset =
            FixedOffset::east_opt(sign * (hours * 60 + minutes) * 60).ok_or_else(malformed)?;
        let date = offset
            .timestamp_opt(epoch, 0)
            .single()
            .ok_or_else(malformed)?;

        Ok(Self {
            name: captures[1].to_string(),
            email: captures[2].to_string(),
            date,
        })
    }
}

impl std::fmt::Display for CommitIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// A commit message trailer, e.g. `Co-Authored-By: name <email>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trailer {
    pub token: String,
    pub value: String,
}

/// Parse the output of `%(trailers:unfold,only)`, one trailer per line.
/// The unfold modifier guarantees `: ` separates token from value.
pub(crate) fn parse_unfolded_trailers(trailers: &str) -> Vec<Trailer> {
    trailers
        .lines()
        .filter_map(|line| {
            let ix = line.find(':')?;
            (ix > 0).then(|| Trailer {
                token: line[..ix].trim().to_string(),
                value: line[ix + 1..].trim().to_string(),
            })
        })
        .collect()
}

/// A commit as parsed from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub sha: String,
    pub short_sha: String,
    /// First line of the message, truncated to a sane size.
    pub summary: String,
    /// Rest of the message, also truncated.
    pub body: String,
    pub author: CommitIdentity,
    pub committer: CommitIdentity,
    pub parent_shas: Vec<String>,
    pub trailers: Vec<Trailer>,
    /// Tags pointing at this commit, without the `tag:` prefix.
    pub tags: Vec<String>,
}

/// A changeset: the files a commit touched plus aggregate line counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetData {
    pub files: Vec<CommittedFileChange>,
    pub lines_added: u64,
    pub lines_deleted: u64,
}

fn truncate_on_char_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Get commits reachable from `revision_range` (or HEAD), newest first.
///
/// Exit code 128 is treated as an empty history so that repositories
/// with an unborn HEAD don't error on every history fetch.
pub async fn get_commits(
    executor: &GitExecutor,
    path: &Path,
    revision_range: Option<&str>,
    limit: Option<usize>,
    skip: Option<usize>,
    additional_args: &[String],
) -> Result<Vec<Commit>, GitError> {
    let fields = [
        "%H",
        "%h",
        "%s",
        "%b",
        // Identity strings matching GIT_AUTHOR_IDENT; the date shape
        // depends on --date, which must stay raw.
        "%an <%ae> %ad",
        "%cn <%ce> %cd",
        "%P",
        "%(trailers:unfold,only)",
        "%D",
    ];

    let mut args = vec!["log".to_string()];
    if let Some(range) = revision_range {
        args.push(range.to_string());
    }
    args.push("--date=raw".to_string());
    if let Some(limit) = limit {
        args.push(format!("--max-count={limit}"));
    }
    if let Some(skip) = skip {
        args.push(format!("--skip={skip}"));
    }
    args.extend(log_format_args(&fields));
    args.push("--no-show-signature".to_string());
    args.push("--no-color".to_string());
    args.extend(additional_args.iter().cloned());
    args.push("--".to_string());

    let result = executor
        .git(
            args,
            path,
            "get_commits",
            ExecOptions {
                success_exit_codes: vec![0, 128],
                ..Default::default()
            },
        )
        .await?;

    if result.exit_code == 128 {
        return Ok(Vec::new());
    }

    let records = parse_log_records(&result.stdout_str(), fields.len())?;

    records
        .into_iter()
        .map(|record| {
            let [sha, short_sha, mut summary, mut body, author, committer, parents, trailers, refs] =
                <[String; 9]>::try_from(record).map_err(|record: Vec<String>| {
                    GitError::Malformed(format!("log record had {} fields", record.len()))
                })?;

            truncate_on_char_boundary(&mut summary, MAX_MESSAGE_BYTES);
            truncate_on_char_boundary(&mut body, MAX_MESSAGE_BYTES);

            // %D is of the shape `HEAD -> main, tag: v1, tag: a,comma, origin/main`.
            // Tag names may themselves contain commas, so split on the
            // `, ` that separates refs rather than on every comma.
            let tags = refs
                .split(", ")
                .filter_map(|r| r.strip_prefix("tag: ").map(String::from))
                .collect();

            Ok(Commit {
                sha,
                short_sha,
                summary,
                body,
                author: CommitIdentity::parse(&author)?,
                committer: CommitIdentity::parse(&committer)?,
                parent_shas: if parents.is_empty() {
                    Vec::new()
                } else {
                    parents.split(' ').map(String::from).collect()
                },
                // %(trailers:unfold) always separates with a colon.
                trailers: parse_unfolded_trailers(&trailers),
                tags,
            })
        })
        .collect()
}

/// Get the commit the given ref resolves to, if any.
pub async fn get_commit(
    executor: &GitExecutor,
    path: &Path,
    commitish: &str,
) -> Result<Option<Commit>, GitError> {
    let mut commits = get_commits(executor, path, Some(commitish), Some(1), None, &[]).await?;
    Ok(if commits.is_empty() {
        None
    } else {
        Some(commits.swap_remove(0))
    })
}

/// Get the author identity for each of the given commits, in input
/// order. The shas are fed over stdin to sidestep command-line length
/// limits.
pub async fn get_authors(
    executor: &GitExecutor,
    path: &Path,
    shas: &[String],
) -> Result<Vec<CommitIdentity>, GitError> {
    if shas.is_empty() {
        return Ok(Vec::new());
    }

    let result = executor
        .git(
            [
                "log",
                "--format=format:%an <%ae> %ad",
                "--no-walk=unsorted",
                "--date=raw",
                "-z",
                "--stdin",
            ],
            path,
            "get_authors",
            ExecOptions {
                stdin: Some(shas.join("\n").into_bytes()),
                ..Default::default()
            },
        )
        .await?;

    let stdout = result.stdout_str();
    let authors = stdout
        .split('\0')
        .map(CommitIdentity::parse)
        .collect::<Result<Vec<_>, _>>()?;

    // Duplicate shas in the input collapse to one output record and
    // would silently misalign the mapping.
    if authors.len() != shas.len() {
        return Err(GitError::Malformed(format!(
            "asked for {} authors, git returned {}",
            shas.len(),
            authors.len()
        )));
    }

    Ok(authors)
}

/// Get the files changed in the given commit along with aggregate line
/// counts.
pub async fn get_changed_files(
    executor: &GitExecutor,
    path: &Path,
    sha: &str,
) -> Result<ChangesetData, GitError> {
    // Opt in to rename (-M) and copy (-C) detection, equivalent to
    // setting diff.renames to copies. Order matters: -M before -C
    // disables copy detection.
    let args = [
        "log",
        sha,
        "-C",
        "-M",
        "-m",
        "-1",
        "--no-show-signature",
        "--first-parent",
        "--raw",
        "--format=format:",
        "--numstat",
        "-z",
        "--",
    ];

    let result = executor
        .git(args, path, "get_changed_files", ExecOptions::default())
        .await?;

    parse_raw_log_with_numstat(&result.stdout_str(), sha, &format!("{sha}^"))
}

/// Parse the output of `--raw --numstat -z`.
///
/// Raw entries come first, each a colon-prefixed mode/sha/status field
/// group followed by one path (two for renames and copies, source
/// first). Numstat entries follow, `added TAB deleted TAB` with either
/// the path on the same field or, for renames and copies, the two paths
/// as separate NUL fields. Binary files report `-` counts.
pub fn parse_raw_log_with_numstat(
    stdout: &str,
    sha: &str,
    parent_commitish: &str,
) -> Result<ChangesetData, GitError> {
    let malformed = |what: &str| GitError::Malformed(format!("invalid raw log output ({what})"));

    let lines: Vec<&str> = stdout.split('\0').collect();
    let mut files: Vec<CommittedFileChange> = Vec::new();
    let mut lines_added: u64 = 0;
    let mut lines_deleted: u64 = 0;
    let mut numstat_count = 0;

    let mut i = 0;
    let end = lines.len().saturating_sub(1);
    while i < end {
        let line = lines[i];
        if let Some(fields) = line.strip_prefix(':') {
            let components: Vec<&str> = fields.split(' ').collect();
            let src_mode = *components.first().ok_or_else(|| malformed("src mode"))?;
            let dst_mode = *components.get(1).ok_or_else(|| malformed("dst mode"))?;
            let status = *components.last().ok_or_else(|| malformed("status"))?;

            let old_path = if status.starts_with('R') || status.starts_with('C') {
                i += 1;
                Some(
                    lines
                        .get(i)
                        .ok_or_else(|| malformed("old path"))?
                        .to_string(),
                )
            } else {
                None
            };

            i += 1;
            let path = lines.get(i).ok_or_else(|| malformed("path"))?;

            files.push(CommittedFileChange {
                path: path.to_string(),
                status: map_status(status, old_path, src_mode, dst_mode),
                commitish: sha.to_string(),
                parent_commitish: parent_commitish.to_string(),
            });
        } else {
            let (added, deleted) = {
                let mut parts = line.splitn(3, '\t');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(added), Some(deleted), Some(_)) => (added, deleted),
                    _ => return Err(malformed("numstat line")),
                }
            };

            if added != "-" {
                lines_added += added.parse::<u64>().map_err(|_| malformed("added count"))?;
            }
            if deleted != "-" {
                lines_deleted += deleted
                    .parse::<u64>()
                    .map_err(|_| malformed("deleted count"))?;
            }

            // Rename and copy numstat entries put their two paths on
            // separate NUL fields; everything else keeps the path on
            // the counts line.
            let file = files
                .get(numstat_count)
                .ok_or_else(|| malformed("numstat without raw entry"))?;
            if file.status.is_copy_or_rename() {
                i += 2;
            }
            numstat_count += 1;
        }
        i += 1;
    }

    Ok(ChangesetData {
        files,
        lines_added,
        lines_deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::FileStatus;

    #[test]
    fn identity_parses_raw_date_and_offset() {
        let identity = CommitIdentity::parse("Jane Doe <jane@example.com> 1475670580 +0200")
            .expect("valid identity");
        assert_eq!(identity.name, "Jane Doe");
        assert_eq!(identity.email, "jane@example.com");
        assert_eq!(identity.date.timestamp(), 1475670580);
        assert_eq!(identity.date.offset().local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn identity_parses_negative_offset() {
        let identity =
            CommitIdentity::parse("J <j@x> 1475670580 -0730").expect("valid identity");
        assert_eq!(
            identity.date.offset().local_minus_utc(),
            -(7 * 3600 + 30 * 60)
        );
    }

    #[test]
    fn identity_with_empty_name_and_email_still_parses() {
        let identity = CommitIdentity::parse(" <> 1475670580 +0000").expect("valid identity");
        assert_eq!(identity.name, "");
        assert_eq!(identity.email, "");
    }

    #[test]
    fn identity_without_date_is_malformed() {
        assert!(CommitIdentity::parse("Jane Doe <jane@example.com>").is_err());
    }

    #[test]
    fn trailers_split_on_first_colon() {
        let trailers = parse_unfolded_trailers(
            "Co-Authored-By: Jane <jane@example.com>\nSigned-off-by: J <j@x>\nnot a trailer\n",
        );
        assert_eq!(
            trailers,
            vec![
                Trailer {
                    token: "Co-Authored-By".to_string(),
                    value: "Jane <jane@example.com>".to_string(),
                },
                Trailer {
                    token: "Signed-off-by".to_string(),
                    value: "J <j@x>".to_string(),
                },
            ]
        );
    }

    #[test]
    fn raw_log_with_numstat_parses_plain_entries() {
        let stdout = ":100644 100644 5716ca5 db3c77d M\0one.txt\0\
                      :100644 100644 0835e4f 28096ea M\0two.txt\0\
                      1\t0\tone.txt\0\
                      2\t1\ttwo.txt\0";
        let changeset = parse_raw_log_with_numstat(stdout, "abc", "abc^").expect("valid output");
        assert_eq!(changeset.files.len(), 2);
        assert_eq!(changeset.files[0].path, "one.txt");
        assert_eq!(changeset.files[0].commitish, "abc");
        assert_eq!(changeset.files[0].parent_commitish, "abc^");
        assert_eq!(changeset.lines_added, 3);
        assert_eq!(changeset.lines_deleted, 1);
    }

    #[test]
    fn raw_log_with_numstat_parses_renames() {
        let stdout = ":100644 100644 5716ca5 db3c77d R086\0old.txt\0new.txt\0\
                      3\t1\t\0old.txt\0new.txt\0";
        let changeset = parse_raw_log_with_numstat(stdout, "abc", "abc^").expect("valid output");
        assert_eq!(changeset.files.len(), 1);
        assert_eq!(changeset.files[0].path, "new.txt");
        assert_eq!(
            changeset.files[0].status,
            FileStatus::Renamed {
                old_path: "old.txt".to_string(),
                rename_includes_modifications: true,
                submodule_status: None,
            }
        );
        assert_eq!(changeset.lines_added, 3);
        assert_eq!(changeset.lines_deleted, 1);
    }

    #[test]
    fn binary_numstat_counts_as_zero() {
        let stdout = ":100644 100644 5716ca5 db3c77d M\0img.png\0-\t-\timg.png\0";
        let changeset = parse_raw_log_with_numstat(stdout, "abc", "abc^").expect("valid output");
        assert_eq!(changeset.lines_added, 0);
        assert_eq!(changeset.lines_deleted, 0);
    }

    #[test]
    fn empty_raw_log_is_an_empty_changeset() {
        let changeset = parse_raw_log_with_numstat("", "abc", "abc^").expect("valid output");
        assert!(changeset.files.is_empty());
    }

    #[test]
    fn message_truncation_respects_char_boundaries() {
        let mut text = format!("{}é", "a".repeat(MAX_MESSAGE_BYTES - 1));
        truncate_on_char_boundary(&mut text, MAX_MESSAGE_BYTES);
        assert_eq!(text.len(), MAX_MESSAGE_BYTES - 1);
    }
}
