//! Git by way of its command-line interface.
//!
//! This crate owns everything between a domain-level request ("list the
//! branches", "stash this") and the `git` child process that serves it:
//! argument construction, the credential trampoline environment, output
//! capture and parsing, and the classification of git's many ways of
//! failing into a closed error taxonomy.

pub mod branches;
mod delimited;
pub mod errors;
pub mod exec;
pub mod log;
pub mod stash;
pub mod status;
mod tail;
pub mod trampoline;

pub use branches::{
    Branch, BranchType, TrackingBranch, get_branches, get_branches_differing_from_upstream,
};
pub use errors::GitErrorKind;
pub use exec::{
    ExecOptions, GitCommandError, GitError, GitExecutor, GitResult, is_config_file_lock_error,
    parse_commit_sha, parse_config_lock_file_path, rebase_arguments,
};
pub use log::{
    ChangesetData, Commit, CommitIdentity, Trailer, get_authors, get_changed_files, get_commit,
    get_commits,
};
pub use stash::{
    DESKTOP_STASH_ENTRY_MARKER, StashEntry, StashResult, create_desktop_stash_entry,
    create_desktop_stash_message, drop_desktop_stash_entry,
    get_last_desktop_stash_entry_for_branch, get_stashed_files, get_stashes, move_stash_entry,
    pop_stash_entry,
};
pub use status::{CommittedFileChange, FileStatus, SUBMODULE_FILE_MODE, SubmoduleStatus};
pub use trampoline::{SessionMetadata, SessionToken, TrampolineConfig, TrampolineSessions};
