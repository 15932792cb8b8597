//! Branch enumeration via `git for-each-ref`.

use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    delimited::{for_each_ref_format_arg, parse_ref_records},
    errors::GitErrorKind,
    exec::{ExecOptions, GitError, GitExecutor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BranchType {
    Local,
    Remote,
}

/// A local or remote branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    /// Short name, e.g. `main` or `origin/main`.
    pub name: String,
    /// Short name of the upstream, when one is configured.
    pub upstream: Option<String>,
    /// The SHA the branch points at.
    pub tip_sha: String,
    pub branch_type: BranchType,
    /// Full ref, e.g. `refs/heads/main`.
    pub ref_name: String,
}

/// A local branch paired with its upstream, where the two point at
/// different commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingBranch {
    pub ref_name: String,
    pub sha: String,
    pub upstream_ref: String,
    pub upstream_sha: String,
}

/// Get all branches under the given ref prefixes (`refs/heads` and
/// `refs/remotes` when none are given). Symbolic refs such as
/// `origin/HEAD` are excluded. A directory that is not a repository
/// yields an empty list rather than an error.
pub async fn get_branches(
    executor: &GitExecutor,
    path: &Path,
    prefixes: &[&str],
) -> Result<Vec<Branch>, GitError> {
    let fields = [
        "%(refname)",
        "%(refname:short)",
        "%(upstream:short)",
        "%(objectname)",
        "%(symref)",
    ];

    let mut args = vec![
        "for-each-ref".to_string(),
        for_each_ref_format_arg(&fields),
    ];
    if prefixes.is_empty() {
        args.push("refs/heads".to_string());
        args.push("refs/remotes".to_string());
    } else {
        args.extend(prefixes.iter().map(|p| p.to_string()));
    }

    let result = executor
        .git(
            args,
            path,
            "get_branches",
            ExecOptions {
                expected_errors: vec![GitErrorKind::NotAGitRepository],
                ..Default::default()
            },
        )
        .await?;

    if result.classified_error == Some(GitErrorKind::NotAGitRepository) {
        return Ok(Vec::new());
    }

    let mut branches = Vec::new();
    for record in parse_ref_records(&result.stdout_str(), fields.len())? {
        let [ref_name, short_name, upstream, sha, symref] =
            <[String; 5]>::try_from(record).map_err(|record: Vec<String>| {
                GitError::Malformed(format!("ref record had {} fields", record.len()))
            })?;

        if !symref.is_empty() {
            continue;
        }

        let branch_type = if ref_name.starts_with("refs/heads") {
            BranchType::Local
        } else {
            BranchType::Remote
        };

        branches.push(Branch {
            name: short_name,
            upstream: (!upstream.is_empty()).then_some(upstream),
            tip_sha: sha,
            branch_type,
            ref_name,
        });
    }

    Ok(branches)
}

/// Get all local branches whose tip differs from their upstream's,
/// excluding the current branch. Useful to narrow down candidates for a
/// fast-forward pass.
pub async fn get_branches_differing_from_upstream(
    executor: &GitExecutor,
    path: &Path,
) -> Result<Vec<TrackingBranch>, GitError> {
    let fields = [
        "%(refname)",
        "%(objectname)",
        "%(upstream)",
        "%(symref)",
        "%(HEAD)",
    ];

    let args = vec![
        "for-each-ref".to_string(),
        for_each_ref_format_arg(&fields),
        "refs/heads".to_string(),
        "refs/remotes".to_string(),
    ];

    let result = executor
        .git(
            args,
            path,
            "get_branches_differing_from_upstream",
            ExecOptions {
                expected_errors: vec![GitErrorKind::NotAGitRepository],
                ..Default::default()
            },
        )
        .await?;

    if result.classified_error == Some(GitErrorKind::NotAGitRepository) {
        return Ok(Vec::new());
    }

    struct LocalBranch {
        ref_name: String,
        sha: String,
        upstream: String,
    }

    let mut local_branches = Vec::new();
    let mut remote_shas: HashMap<String, String> = HashMap::new();

    for record in parse_ref_records(&result.stdout_str(), fields.len())? {
        let [ref_name, sha, upstream, symref, head] =
            <[String; 5]>::try_from(record).map_err(|record: Vec<String>| {
                GitError::Malformed(format!("ref record had {} fields", record.len()))
            })?;

        // Skip symbolic refs and the current branch.
        if !symref.is_empty() || head == "*" {
            continue;
        }

        if ref_name.starts_with("refs/heads") {
            if upstream.is_empty() {
                continue;
            }
            local_branches.push(LocalBranch {
                ref_name,
                sha,
                upstream,
            });
        } else {
            remote_shas.insert(ref_name, sha);
        }
    }

    let mut eligible = Vec::new();
    for branch in local_branches {
        if let Some(upstream_sha) = remote_shas.get(&branch.upstream)
            && *upstream_sha != branch.sha
        {
            eligible.push(TrackingBranch {
                ref_name: branch.ref_name,
                sha: branch.sha,
                upstream_ref: branch.upstream,
                upstream_sha: upstream_sha.clone(),
            });
        }
    }

    Ok(eligible)
}
