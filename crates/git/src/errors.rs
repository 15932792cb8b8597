//! Classification of git's stderr/stdout into a closed set of error kinds.
//!
//! The matchers are ordered: more specific patterns must come before the
//! generic ones they overlap with (e.g. the HTTPS authentication failure
//! with a URL before the bare SSH one, the EPOLICYKEYAGE audit error
//! before the plain "Could not read from remote repository").

use std::sync::LazyLock;

use regex::Regex;

/// A git failure we know how to talk about. Parsed from the raw process
/// output; callers pattern-match on this to pick recovery behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitErrorKind {
    SshKeyAuditUnverified,
    SshAuthenticationFailed,
    SshPermissionDenied,
    HttpsAuthenticationFailed,
    RemoteDisconnection,
    HostDown,
    RebaseConflicts,
    MergeConflicts,
    HttpsRepositoryNotFound,
    SshRepositoryNotFound,
    PushNotFastForward,
    BranchDeletionFailed,
    DefaultBranchDeletionFailed,
    RevertConflicts,
    EmptyRebasePatch,
    NoMatchingRemoteBranch,
    NoExistingRemoteBranch,
    NothingToCommit,
    NoSubmoduleMapping,
    SubmoduleRepositoryDoesNotExist,
    InvalidSubmoduleSha,
    LocalPermissionDenied,
    InvalidMerge,
    InvalidRebase,
    NonFastForwardMergeIntoEmptyHead,
    PatchDoesNotApply,
    BranchAlreadyExists,
    BadRevision,
    NotAGitRepository,
    CannotMergeUnrelatedHistories,
    LfsAttributeDoesNotMatch,
    BranchRenameFailed,
    PathDoesNotExist,
    InvalidObjectName,
    OutsideRepository,
    LockFileAlreadyExists,
    NoMergeToAbort,
    LocalChangesOverwritten,
    UnresolvedConflicts,
    // GitHub-side push rejections, reported on stdout by the remote.
    ProtectedBranchForcePush,
    ProtectedBranchRequiresReview,
    ProtectedBranchDeleteRejected,
    ProtectedBranchRequiredStatus,
    PushWithFileSizeExceedingLimit,
    HexBranchNameRejected,
    ForcePushRejected,
    InvalidRefLength,
    PushWithPrivateEmail,
    PushWithSecretDetected,
    ConfigLockFileAlreadyExists,
    RemoteAlreadyExists,
    TagAlreadyExists,
    MergeWithLocalChanges,
    RebaseWithLocalChanges,
    GpgFailedToSignData,
    ConflictModifyDeletedInBranch,
    MergeCommitNoMainlineOption,
    UnsafeDirectory,
    PathExistsButNotInRef,
    BadConfigValue,
}

static MATCHERS: LazyLock<Vec<(Regex, GitErrorKind)>> = LazyLock::new(|| {
    use GitErrorKind::*;

    // Patterns and their relative order follow git's (and GitHub's) actual
    // output. `(?m)` where a pattern anchors on line boundaries.
    let table: &[(&str, GitErrorKind)] = &[
        (
            r"ERROR: ([\s\S]+?)\n+\[EPOLICYKEYAGE\]\n+fatal: Could not read from remote repository\.",
            SshKeyAuditUnverified,
        ),
        (r"fatal: Authentication failed for '(.+)'", HttpsAuthenticationFailed),
        (r"fatal: Authentication failed", SshAuthenticationFailed),
        (r"fatal: Could not read from remote repository\.", SshPermissionDenied),
        (r"The requested URL returned error: 403", HttpsAuthenticationFailed),
        (r"fatal: [Tt]he remote end hung up unexpectedly", RemoteDisconnection),
        (
            r"fatal: unable to access '(.+)': Failed to connect to (.+): Host is down",
            HostDown,
        ),
        (
            r"Cloning into '(.+)'\.\.\.\nfatal: unable to access '(.+)': Could not resolve host: (.+)",
            HostDown,
        ),
        (r"Resolve all conflicts manually, mark them as resolved with", RebaseConflicts),
        (
            r"(Merge conflict|Automatic merge failed; fix conflicts and then commit the result)",
            MergeConflicts,
        ),
        (r"fatal: repository '(.+)' not found", HttpsRepositoryNotFound),
        (r"ERROR: Repository not found", SshRepositoryNotFound),
        (
            r"\((non-fast-forward|fetch first)\)\nerror: failed to push some refs to '.*'",
            PushNotFastForward,
        ),
        (r"error: unable to delete '(.+)': remote ref does not exist", BranchDeletionFailed),
        (
            r"\[remote rejected\] (.+) \(deletion of the current branch prohibited\)",
            DefaultBranchDeletionFailed,
        ),
        (
            r"error: could not revert .*\nhint: after resolving the conflicts, mark the corrected paths\nhint: with 'git add <paths>' or 'git rm <paths>'\nhint: and commit the result with 'git commit'",
            RevertConflicts,
        ),
        (
            r"Applying: .*\nNo changes - did you forget to use 'git add'\?\nIf there is nothing left to stage, chances are that something else\nalready introduced the same changes; you might want to skip this patch\.",
            EmptyRebasePatch,
        ),
        (
            r"There are no candidates for (rebasing|merging) among the refs that you just fetched\.\nGenerally this means that you provided a wildcard refspec which had no\nmatches on the remote end\.",
            NoMatchingRemoteBranch,
        ),
        (
            r"Your configuration specifies to merge with the ref '(.+)'\nfrom the remote, but no such ref was fetched\.",
            NoExistingRemoteBranch,
        ),
        (r"nothing to commit", NothingToCommit),
        (r"[Nn]o submodule mapping found in .gitmodules for path '(.+)'", NoSubmoduleMapping),
        (
            r"fatal: repository '(.+)' does not exist\nfatal: clone of '.+' into submodule path '(.+)' failed",
            SubmoduleRepositoryDoesNotExist,
        ),
        (
            r"Fetched in submodule path '(.+)', but it did not contain (.+)\. Direct fetching of that commit failed\.",
            InvalidSubmoduleSha,
        ),
        (
            r"fatal: could not create work tree dir '(.+)'.*: Permission denied",
            LocalPermissionDenied,
        ),
        (r"merge: (.+) - not something we can merge", InvalidMerge),
        (r"invalid upstream (.+)", InvalidRebase),
        (
            r"fatal: Non-fast-forward commit does not make sense into an empty head",
            NonFastForwardMergeIntoEmptyHead,
        ),
        (
            r"error: (.+): (patch does not apply|already exists in working directory)",
            PatchDoesNotApply,
        ),
        (r"fatal: [Aa] branch named '(.+)' already exists.?", BranchAlreadyExists),
        (r"fatal: bad revision '(.*)'", BadRevision),
        (
            r"fatal: [Nn]ot a git repository \(or any of the parent directories\)",
            NotAGitRepository,
        ),
        (r"fatal: refusing to merge unrelated histories", CannotMergeUnrelatedHistories),
        (r"The .+ attribute should be .+ but is .+", LfsAttributeDoesNotMatch),
        (r"fatal: Branch rename failed", BranchRenameFailed),
        (r"fatal: path '(.+)' does not exist .+", PathDoesNotExist),
        (r"fatal: path '(.+)' exists on disk, but not in '(.+)'", PathExistsButNotInRef),
        (r"fatal: [Ii]nvalid object name '(.+)'\.", InvalidObjectName),
        (r"fatal: .+: '(.+)' is outside repository", OutsideRepository),
        (r"Another git process seems to be running in this repository, e\.g\.", LockFileAlreadyExists),
        (r"fatal: There is no merge to abort", NoMergeToAbort),
        (
            r"error: (?:Your local changes to the following|The following untracked working tree) files would be overwritten by checkout:",
            LocalChangesOverwritten,
        ),
        (
            r"You must edit all merge conflicts and then\nmark them as resolved using git add|fatal: Exiting because of an unresolved conflict",
            UnresolvedConflicts,
        ),
        (
            r"error: Your local changes to the following files would be overwritten by merge:\n",
            MergeWithLocalChanges,
        ),
        (
            r"error: cannot (pull with rebase|rebase): You have unstaged changes\.\n\s*error: [Pp]lease commit or stash them\.",
            RebaseWithLocalChanges,
        ),
        (r"error: commit (.+) is a merge but no -m option was given", MergeCommitNoMainlineOption),
        (r"fatal: detected dubious ownership in repository at '(.+)'", UnsafeDirectory),
        (r"error: gpg failed to sign the data", GpgFailedToSignData),
        (
            r"CONFLICT \(modify/delete\): (.+) deleted in (.+) and modified in (.+)",
            ConflictModifyDeletedInBranch,
        ),
        (r"error: could not lock config file (.+): File exists", ConfigLockFileAlreadyExists),
        (r"error: remote (.+) already exists\.", RemoteAlreadyExists),
        (r"fatal: tag '(.+)' already exists", TagAlreadyExists),
        (
            r"fatal: bad (?:numeric|boolean) config value '(.*)' for '(.+)'",
            BadConfigValue,
        ),
        // Remote rejections from GitHub arrive on stdout with a GH00x code.
        (r"error: GH001: ", PushWithFileSizeExceedingLimit),
        (r"error: GH002: ", HexBranchNameRejected),
        (r"error: GH003: Sorry, force-pushing to (.+) is not allowed\.", ForcePushRejected),
        (r"error: GH005: Sorry, refs longer than (.+) bytes are not allowed", InvalidRefLength),
        (
            r"error: GH006: Protected branch update failed for (.+)\nremote: error: At least (\d+) approving review",
            ProtectedBranchRequiresReview,
        ),
        (
            r"error: GH006: Protected branch update failed for (.+)\nremote: error: Cannot force-push to this protected branch",
            ProtectedBranchForcePush,
        ),
        (
            r"error: GH006: Protected branch update failed for (.+)\nremote: error: Cannot delete a protected branch",
            ProtectedBranchDeleteRejected,
        ),
        (
            r#"error: GH006: Protected branch update failed for (.+)\nremote: error: Required status check "(.+)" is expected"#,
            ProtectedBranchRequiredStatus,
        ),
        (r"error: GH007: Your push would publish a private email address\.", PushWithPrivateEmail),
        (r"remote: error: GH009: Secrets detected! This push failed\.", PushWithSecretDetected),
    ];

    table
        .iter()
        .map(|(pattern, kind)| {
            let re = Regex::new(pattern).unwrap_or_else(|e| panic!("bad matcher {pattern:?}: {e}"));
            (re, *kind)
        })
        .collect()
});

/// Match `stderr` and then `stdout` against the ordered table. Returns
/// `None` when nothing matches, in which case the raw output is the best
/// message we have.
pub fn classify(stderr: &str, stdout: &str) -> Option<GitErrorKind> {
    classify_text(stderr).or_else(|| classify_text(stdout))
}

fn classify_text(text: &str) -> Option<GitErrorKind> {
    if text.is_empty() {
        return None;
    }
    MATCHERS
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, kind)| *kind)
}

/// The authentication failures we present identically to the user. Not
/// an exhaustive list of ways authentication can fail, just the ones that
/// share the same message and recovery affordances.
pub fn is_auth_failure(kind: GitErrorKind) -> bool {
    matches!(
        kind,
        GitErrorKind::SshAuthenticationFailed
            | GitErrorKind::SshPermissionDenied
            | GitErrorKind::HttpsAuthenticationFailed
    )
}

/// The offending key/value pair from a `bad config value` failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadConfigValueInfo {
    pub key: String,
    pub value: String,
}

static BAD_CONFIG_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^fatal: bad (?:numeric|boolean) config value '(.*)' for '(.+)'")
        .unwrap_or_else(|e| panic!("bad config value matcher: {e}"))
});

pub fn parse_bad_config_value_info(stderr: &str) -> Option<BadConfigValueInfo> {
    BAD_CONFIG_VALUE_RE.captures(stderr).map(|c| BadConfigValueInfo {
        value: c[1].to_string(),
        key: c[2].to_string(),
    })
}

/// Map a classified kind to one human-readable description, or `None`
/// for the kinds where git's own message is already the best copy. The
/// match is exhaustive on purpose: adding a kind without deciding its
/// description is a compile error.
pub fn describe(kind: GitErrorKind, stderr: &str) -> Option<String> {
    use GitErrorKind::*;

    match kind {
        SshAuthenticationFailed | SshPermissionDenied | HttpsAuthenticationFailed => {
            Some(auth_failure_description())
        }
        BadConfigValue => Some(match parse_bad_config_value_info(stderr) {
            Some(info) => format!(
                "Unsupported value '{}' for git config key '{}'",
                info.value, info.key
            ),
            None => "Unsupported git configuration value.".to_string(),
        }),
        SshKeyAuditUnverified => Some("The SSH key is unverified.".into()),
        RemoteDisconnection => {
            Some("The remote disconnected. Check your Internet connection and try again.".into())
        }
        HostDown => Some("The host is down. Check your Internet connection and try again.".into()),
        RebaseConflicts => Some(
            "We found some conflicts while trying to rebase. Please resolve the conflicts before continuing."
                .into(),
        ),
        MergeConflicts => Some(
            "We found some conflicts while trying to merge. Please resolve the conflicts and commit the changes."
                .into(),
        ),
        HttpsRepositoryNotFound | SshRepositoryNotFound => Some(
            "The repository does not seem to exist anymore. You may not have access, or it may have been deleted or renamed."
                .into(),
        ),
        PushNotFastForward => Some(
            "The repository has been updated since you last pulled. Try pulling before pushing."
                .into(),
        ),
        BranchDeletionFailed => {
            Some("Could not delete the branch. It was probably already deleted.".into())
        }
        DefaultBranchDeletionFailed => {
            Some("The branch is the repository's default branch and cannot be deleted.".into())
        }
        RevertConflicts => {
            Some("To finish reverting, please merge and commit the changes.".into())
        }
        EmptyRebasePatch => Some("There aren't any changes left to apply.".into()),
        NoMatchingRemoteBranch => {
            Some("There aren't any remote branches that match the current branch.".into())
        }
        NothingToCommit => Some("There are no changes to commit.".into()),
        NoSubmoduleMapping => Some(
            "A submodule was removed from .gitmodules, but the folder still exists in the repository. Delete the folder, commit the change, then try again."
                .into(),
        ),
        SubmoduleRepositoryDoesNotExist => {
            Some("A submodule points to a location which does not exist.".into())
        }
        InvalidSubmoduleSha => Some("A submodule points to a commit which does not exist.".into()),
        LocalPermissionDenied => Some("Permission denied.".into()),
        InvalidMerge => Some("This is not something we can merge.".into()),
        InvalidRebase => Some("This is not something we can rebase.".into()),
        NonFastForwardMergeIntoEmptyHead => Some(
            "The merge you attempted is not a fast-forward, so it cannot be performed on an empty branch."
                .into(),
        ),
        PatchDoesNotApply => Some(
            "The requested changes conflict with one or more files in the repository.".into(),
        ),
        BranchAlreadyExists => Some("A branch with that name already exists.".into()),
        BadRevision => Some("Bad revision.".into()),
        NotAGitRepository => Some("This is not a git repository.".into()),
        ProtectedBranchForcePush => {
            Some("This branch is protected from force-push operations.".into())
        }
        ProtectedBranchRequiresReview => Some(
            "This branch is protected and any changes requires an approved review. Open a pull request with changes targeting this branch instead."
                .into(),
        ),
        PushWithFileSizeExceedingLimit => Some(
            "The push operation includes a file which exceeds GitHub's file size restriction of 100MB. Please remove the file from history and try again."
                .into(),
        ),
        HexBranchNameRejected => Some(
            "The branch name cannot be a 40-character string of hexadecimal characters, as this is the format that Git uses for representing objects."
                .into(),
        ),
        ForcePushRejected => {
            Some("The force push has been rejected for the current branch.".into())
        }
        InvalidRefLength => Some("A ref cannot be longer than 255 characters.".into()),
        CannotMergeUnrelatedHistories => {
            Some("Unable to merge unrelated histories in this repository.".into())
        }
        PushWithPrivateEmail => Some(
            "Cannot push these commits as they contain an email address marked as private on GitHub. To push anyway, visit https://github.com/settings/emails, uncheck \"Keep my email address private\", then push your commits again. You can then enable the setting again."
                .into(),
        ),
        LfsAttributeDoesNotMatch => Some(
            "Git LFS attribute found in global Git configuration does not match expected value."
                .into(),
        ),
        ProtectedBranchDeleteRejected => Some(
            "This branch cannot be deleted from the remote repository because it is marked as protected."
                .into(),
        ),
        ProtectedBranchRequiredStatus => Some(
            "The push was rejected by the remote server because a required status check has not been satisfied."
                .into(),
        ),
        BranchRenameFailed => Some("The branch could not be renamed.".into()),
        PathDoesNotExist => Some("The path does not exist on disk.".into()),
        InvalidObjectName => Some("The object was not found in the Git repository.".into()),
        OutsideRepository => Some("This path is not a valid path inside the repository.".into()),
        LockFileAlreadyExists => Some(
            "A lock file already exists in the repository, which blocks this operation from completing."
                .into(),
        ),
        NoMergeToAbort => {
            Some("There is no merge in progress, so there is nothing to abort.".into())
        }
        NoExistingRemoteBranch => Some("The remote branch does not exist.".into()),
        LocalChangesOverwritten => Some(
            "Unable to switch branches as there are working directory changes which would be overwritten. Please commit or stash your changes."
                .into(),
        ),
        UnresolvedConflicts => {
            Some("There are unresolved conflicts in the working directory.".into())
        }
        TagAlreadyExists => Some("A tag with that name already exists".into()),
        // For these, git's own message is precise; let the raw output
        // through rather than paraphrasing it.
        ConfigLockFileAlreadyExists
        | RemoteAlreadyExists
        | MergeWithLocalChanges
        | RebaseWithLocalChanges
        | GpgFailedToSignData
        | ConflictModifyDeletedInBranch
        | MergeCommitNoMainlineOption
        | UnsafeDirectory
        | PathExistsButNotInRef
        | PushWithSecretDetected => None,
    }
}

/// The shared troubleshooting copy for every authentication failure kind
/// ([`is_auth_failure`]). Also used by the trampoline layer when it
/// synthesizes an auth failure from a credential-helper miss.
pub fn auth_failure_description() -> String {
    let menu_hint = if cfg!(target_os = "macos") {
        "the application settings menu."
    } else {
        "File > Options."
    };
    format!(
        "Authentication failed. Some common reasons include:

- You are not logged in to your account: see {menu_hint}
- You may need to log out and log back in to refresh your token.
- You do not have permission to access this repository.
- The repository is archived. Check the repository settings to confirm you are still permitted to push commits.
- If you use SSH authentication, check that your key is added to the ssh-agent and associated with your account.
- If you use SSH authentication, ensure the host key verification passes for your repository hosting service.
- If you used username / password authentication, you might need to use a Personal Access Token instead of your account password. Check the documentation of your repository hosting service."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_a_repository() {
        let stderr = "fatal: not a git repository (or any of the parent directories): .git\n";
        assert_eq!(classify(stderr, ""), Some(GitErrorKind::NotAGitRepository));
    }

    #[test]
    fn https_auth_failure_beats_ssh_auth_failure() {
        let stderr = "fatal: Authentication failed for 'https://github.com/o/r.git/'\n";
        assert_eq!(
            classify(stderr, ""),
            Some(GitErrorKind::HttpsAuthenticationFailed)
        );
        assert_eq!(
            classify("fatal: Authentication failed\n", ""),
            Some(GitErrorKind::SshAuthenticationFailed)
        );
    }

    #[test]
    fn audit_error_beats_permission_denied() {
        let stderr = "ERROR: key expired\n\n[EPOLICYKEYAGE]\n\nfatal: Could not read from remote repository.";
        assert_eq!(
            classify(stderr, ""),
            Some(GitErrorKind::SshKeyAuditUnverified)
        );
        assert_eq!(
            classify("fatal: Could not read from remote repository.\n", ""),
            Some(GitErrorKind::SshPermissionDenied)
        );
    }

    #[test]
    fn stdout_is_consulted_when_stderr_does_not_match() {
        let stdout = "remote: error: GH007: Your push would publish a private email address.\n";
        assert_eq!(
            classify("some unrelated noise", stdout),
            Some(GitErrorKind::PushWithPrivateEmail)
        );
    }

    #[test]
    fn nothing_matches_yields_none() {
        assert_eq!(classify("warning: something benign\n", ""), None);
        assert_eq!(classify("", ""), None);
    }

    #[test]
    fn bad_config_value_extraction() {
        let stderr = "fatal: bad numeric config value 'nope' for 'core.repositoryformatversion'\n";
        assert_eq!(classify(stderr, ""), Some(GitErrorKind::BadConfigValue));
        let info = parse_bad_config_value_info(stderr).expect("should parse");
        assert_eq!(info.value, "nope");
        assert_eq!(info.key, "core.repositoryformatversion");
        assert_eq!(
            describe(GitErrorKind::BadConfigValue, stderr).as_deref(),
            Some("Unsupported value 'nope' for git config key 'core.repositoryformatversion'")
        );
        // Extraction failure falls back to the generic message.
        assert_eq!(
            describe(GitErrorKind::BadConfigValue, "garbage").as_deref(),
            Some("Unsupported git configuration value.")
        );
    }

    #[test]
    fn auth_failures_share_one_description() {
        let ssh = describe(GitErrorKind::SshAuthenticationFailed, "");
        let https = describe(GitErrorKind::HttpsAuthenticationFailed, "");
        let denied = describe(GitErrorKind::SshPermissionDenied, "");
        assert!(ssh.is_some());
        assert_eq!(ssh, https);
        assert_eq!(https, denied);
    }

    #[test]
    fn raw_message_kinds_describe_to_none() {
        assert_eq!(describe(GitErrorKind::RemoteAlreadyExists, ""), None);
        assert_eq!(describe(GitErrorKind::ConfigLockFileAlreadyExists, ""), None);
        assert_eq!(describe(GitErrorKind::UnsafeDirectory, ""), None);
    }

    #[test]
    fn every_matcher_compiles() {
        assert!(!MATCHERS.is_empty());
    }
}
