//! File status models for committed changes.

use serde::{Deserialize, Serialize};

/// File mode git reserves for gitlink entries, i.e. submodules.
pub const SUBMODULE_FILE_MODE: &str = "160000";

/// What changed inside a submodule entry, as far as a historical diff
/// can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmoduleStatus {
    /// The submodule points at a different commit than before.
    pub commit_changed: bool,
    /// The working copy of the submodule has new files. Never set for
    /// committed changes.
    pub untracked_changes: bool,
    /// The working copy of the submodule has modified files. Never set
    /// for committed changes.
    pub modified_changes: bool,
}

/// The status of a file within a commit. Rename and copy statuses carry
/// the path the content came from; no other status has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FileStatus {
    New {
        submodule_status: Option<SubmoduleStatus>,
    },
    Modified {
        submodule_status: Option<SubmoduleStatus>,
    },
    Deleted {
        submodule_status: Option<SubmoduleStatus>,
    },
    Untracked {
        submodule_status: Option<SubmoduleStatus>,
    },
    Renamed {
        old_path: String,
        /// True when the similarity score was below 100%, i.e. the file
        /// was edited in the same commit that renamed it.
        rename_includes_modifications: bool,
        submodule_status: Option<SubmoduleStatus>,
    },
    Copied {
        old_path: String,
        submodule_status: Option<SubmoduleStatus>,
    },
}

impl FileStatus {
    pub fn is_copy_or_rename(&self) -> bool {
        matches!(self, FileStatus::Renamed { .. } | FileStatus::Copied { .. })
    }

    pub fn old_path(&self) -> Option<&str> {
        match self {
            FileStatus::Renamed { old_path, .. } | FileStatus::Copied { old_path, .. } => {
                Some(old_path)
            }
            _ => None,
        }
    }

    pub fn submodule_status(&self) -> Option<SubmoduleStatus> {
        match self {
            FileStatus::New { submodule_status }
            | FileStatus::Modified { submodule_status }
            | FileStatus::Deleted { submodule_status }
            | FileStatus::Untracked { submodule_status }
            | FileStatus::Renamed {
                submodule_status, ..
            }
            | FileStatus::Copied {
                submodule_status, ..
            } => *submodule_status,
        }
    }
}

/// A file that changed in a particular commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedFileChange {
    pub path: String,
    pub status: FileStatus,
    /// The commit the change belongs to.
    pub commitish: String,
    /// What to diff `commitish` against to reproduce this change.
    pub parent_commitish: String,
}

/// Infer submodule state from the raw status letter and the entry file
/// modes. A modified gitlink on both sides means the pinned commit
/// moved; an added or deleted gitlink is a plain content change with no
/// working-copy component.
pub(crate) fn map_submodule_status(
    status: &str,
    src_mode: &str,
    dst_mode: &str,
) -> Option<SubmoduleStatus> {
    if src_mode == SUBMODULE_FILE_MODE && dst_mode == SUBMODULE_FILE_MODE && status == "M" {
        Some(SubmoduleStatus {
            commit_changed: true,
            untracked_changes: false,
            modified_changes: false,
        })
    } else if (src_mode == SUBMODULE_FILE_MODE && status == "D")
        || (dst_mode == SUBMODULE_FILE_MODE && status == "A")
    {
        Some(SubmoduleStatus {
            commit_changed: false,
            untracked_changes: false,
            modified_changes: false,
        })
    } else {
        None
    }
}

fn is_scored(status: &str, letter: char) -> bool {
    status
        .strip_prefix(letter)
        .is_some_and(|score| !score.is_empty() && score.bytes().all(|b| b.is_ascii_digit()))
}

/// Map a raw status field from `--raw` output to a [`FileStatus`].
///
/// Rename and copy detection append a similarity score to the letter
/// (`R086`, `C100`); a score below 100 on a rename means the commit
/// also modified the file. Unrecognized statuses degrade to `Modified`.
pub(crate) fn map_status(
    raw_status: &str,
    old_path: Option<String>,
    src_mode: &str,
    dst_mode: &str,
) -> FileStatus {
    let status = raw_status.trim();
    let submodule_status = map_submodule_status(status, src_mode, dst_mode);

    match (status, old_path) {
        ("M", _) => FileStatus::Modified { submodule_status },
        ("A", _) => FileStatus::New { submodule_status },
        ("?", _) => FileStatus::Untracked { submodule_status },
        ("D", _) => FileStatus::Deleted { submodule_status },
        ("R", Some(old_path)) => FileStatus::Renamed {
            old_path,
            rename_includes_modifications: false,
            submodule_status,
        },
        ("C", Some(old_path)) => FileStatus::Copied {
            old_path,
            submodule_status,
        },
        (_, Some(old_path)) if is_scored(status, 'R') => FileStatus::Renamed {
            old_path,
            rename_includes_modifications: status != "R100",
            submodule_status,
        },
        (_, Some(old_path)) if is_scored(status, 'C') => FileStatus::Copied {
            old_path,
            submodule_status,
        },
        _ => FileStatus::Modified { submodule_status },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_statuses_map_by_letter() {
        assert_eq!(
            map_status("M", None, "100644", "100644"),
            FileStatus::Modified {
                submodule_status: None
            }
        );
        assert_eq!(
            map_status("A", None, "000000", "100644"),
            FileStatus::New {
                submodule_status: None
            }
        );
        assert_eq!(
            map_status("D", None, "100644", "000000"),
            FileStatus::Deleted {
                submodule_status: None
            }
        );
    }

    #[test]
    fn perfect_rename_has_no_modifications() {
        let status = map_status("R100", Some("old.txt".to_string()), "100644", "100644");
        assert_eq!(
            status,
            FileStatus::Renamed {
                old_path: "old.txt".to_string(),
                rename_includes_modifications: false,
                submodule_status: None,
            }
        );
    }

    #[test]
    fn partial_rename_includes_modifications() {
        let status = map_status("R086", Some("old.txt".to_string()), "100644", "100644");
        assert!(matches!(
            status,
            FileStatus::Renamed {
                rename_includes_modifications: true,
                ..
            }
        ));
    }

    #[test]
    fn copy_never_includes_modifications() {
        let status = map_status("C075", Some("src.txt".to_string()), "100644", "100644");
        assert_eq!(
            status,
            FileStatus::Copied {
                old_path: "src.txt".to_string(),
                submodule_status: None,
            }
        );
    }

    #[test]
    fn rename_without_old_path_degrades_to_modified() {
        assert_eq!(
            map_status("R086", None, "100644", "100644"),
            FileStatus::Modified {
                submodule_status: None
            }
        );
    }

    #[test]
    fn statuses_serialize_with_a_kind_tag() {
        let status = FileStatus::Renamed {
            old_path: "old.txt".to_string(),
            rename_includes_modifications: true,
            submodule_status: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["kind"], "renamed");
        assert_eq!(json["oldPath"], "old.txt");
        assert_eq!(json["renameIncludesModifications"], true);
    }

    #[test]
    fn modified_gitlink_is_a_commit_change() {
        let status = map_status("M", None, SUBMODULE_FILE_MODE, SUBMODULE_FILE_MODE);
        assert_eq!(
            status.submodule_status(),
            Some(SubmoduleStatus {
                commit_changed: true,
                untracked_changes: false,
                modified_changes: false,
            })
        );
    }

    #[test]
    fn added_gitlink_has_no_working_copy_component() {
        let status = map_status("A", None, "000000", SUBMODULE_FILE_MODE);
        assert_eq!(
            status.submodule_status(),
            Some(SubmoduleStatus {
                commit_changed: false,
                untracked_changes: false,
                modified_changes: false,
            })
        );
    }
}
