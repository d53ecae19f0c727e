use std::collections::BTreeSet;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::source::Identity;

/// Deletion counts for one file of a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileCoverage {
    /// Qualifying deletions whose author did not review
    pub unapproved_deletions: usize,
    /// Deletions of lines written by someone other than the change author
    pub total_deletions: usize,
    /// Authors of unapproved deletions
    pub unassigned_authors: BTreeSet<Identity>,
}

/// Result of scoring one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Counted(FileCoverage),
    /// No qualifying deletions; the file must not count toward any average.
    NoDeletions,
}

/// Why a unit was left out of its parent's average.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NotMerged,
    NewFile,
    NoPatch,
    TooManyDeletions { deletions: usize, limit: usize },
    NoBlame,
    NoHistory,
    NoQualifyingDeletions,
    NoConsideredChildren { children: &'static str },
    /// The run was cancelled before the unit completed any child.
    Cancelled,
    Fetch { what: &'static str, error: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotMerged => write!(f, "not merged"),
            SkipReason::NewFile => write!(f, "file does not exist in the base revision"),
            SkipReason::NoPatch => write!(f, "no text patch available"),
            SkipReason::TooManyDeletions { deletions, limit } => write!(
                f,
                "{} deletions exceeds the limit of {}",
                deletions, limit
            ),
            SkipReason::NoBlame => write!(f, "no blame available for the base revision"),
            SkipReason::NoHistory => write!(f, "no commit history for the file"),
            SkipReason::NoQualifyingDeletions => write!(f, "no non-author deletions"),
            SkipReason::NoConsideredChildren { children } => {
                write!(f, "no {} with coverage", children)
            }
            SkipReason::Cancelled => write!(f, "cancelled before completion"),
            SkipReason::Fetch { what, error } => write!(f, "failed to fetch {}: {}", what, error),
        }
    }
}

impl Serialize for SkipReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A unit left out of its parent's average, with the reason.
///
/// `skipped` keeps the unit's own skipped children, so a pull request that
/// was dropped still reports which of its files were dropped and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Skipped {
    pub name: String,
    pub reason: SkipReason,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<Skipped>,
}

impl Skipped {
    pub fn new(name: impl Into<String>, reason: SkipReason) -> Self {
        Self::with_children(name, reason, Vec::new())
    }

    pub fn with_children(name: impl Into<String>, reason: SkipReason, skipped: Vec<Skipped>) -> Self {
        Self {
            name: name.into(),
            reason,
            skipped,
        }
    }
}

/// Coverage of one merged pull request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeCoverage {
    pub id: u64,
    pub author: Identity,
    pub reviewers: BTreeSet<Identity>,
    pub total_deletions: usize,
    pub total_unapproved_deletions: usize,
    #[serde(rename = "relevant_authors_who_did_not_review")]
    pub unassigned_authors: BTreeSet<Identity>,
    pub coverage: f64,
    pub skipped_files: Vec<Skipped>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoCoverage {
    pub name: String,
    pub coverage: f64,
    pub changes_considered: usize,
    #[serde(rename = "pull_requests")]
    pub changes: Vec<ChangeCoverage>,
    pub skipped_changes: Vec<Skipped>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceCoverage {
    pub name: String,
    pub coverage: f64,
    pub repos_considered: usize,
    #[serde(rename = "repositories")]
    pub repos: Vec<RepoCoverage>,
    pub skipped_repos: Vec<Skipped>,
}

/// Root of the report tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub provider: String,
    /// Mean of workspace coverages; `None` when no workspace was considered
    pub coverage: Option<f64>,
    pub workspaces_considered: usize,
    pub workspaces: Vec<WorkspaceCoverage>,
    pub skipped_workspaces: Vec<Skipped>,
    /// Set when the run was interrupted and the tree holds partial results
    pub cancelled: bool,
}
