//! Roll-up of file results into changes, repositories, workspaces and the
//! final report.
//!
//! Each accumulator owns its aggregate and only accepts children that have
//! already finished. A unit with nothing to average becomes a skip entry in
//! its parent instead of a zero score, carrying its own skipped children. Means are unweighted: every child
//! counts once regardless of its size.

use std::collections::{BTreeSet, HashSet};

use crate::coverage::{
    coverage_ratio, ChangeCoverage, CoverageReport, FileCoverage, FileOutcome, RepoCoverage,
    SkipReason, Skipped, WorkspaceCoverage,
};
use crate::source::{Change, Identity};

/// Final state of a unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Considered(T),
    Skipped {
        reason: SkipReason,
        children: Vec<Skipped>,
    },
}

impl<T> Outcome<T> {
    /// A skip with no skipped children of its own.
    pub fn skipped(reason: SkipReason) -> Self {
        Outcome::Skipped {
            reason,
            children: Vec::new(),
        }
    }
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> Option<f64> {
    let count = values.len();
    if count == 0 {
        return None;
    }
    Some(values.sum::<f64>() / count as f64)
}

pub struct ChangeAccumulator {
    id: u64,
    author: Identity,
    reviewers: BTreeSet<Identity>,
    total_deletions: usize,
    total_unapproved_deletions: usize,
    unassigned_authors: BTreeSet<Identity>,
    skipped_files: Vec<Skipped>,
}

impl ChangeAccumulator {
    pub fn new(change: &Change, reviewers: &HashSet<Identity>) -> Self {
        Self {
            id: change.id,
            author: change.author.clone(),
            reviewers: reviewers.iter().cloned().collect(),
            total_deletions: 0,
            total_unapproved_deletions: 0,
            unassigned_authors: BTreeSet::new(),
            skipped_files: Vec::new(),
        }
    }

    pub fn record_file(&mut self, path: &str, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Counted(file) => self.add_file(file),
            FileOutcome::NoDeletions => self.skip_file(path, SkipReason::NoQualifyingDeletions),
        }
    }

    fn add_file(&mut self, file: FileCoverage) {
        self.total_deletions += file.total_deletions;
        self.total_unapproved_deletions += file.unapproved_deletions;
        self.unassigned_authors.extend(file.unassigned_authors);
    }

    pub fn skip_file(&mut self, path: &str, reason: SkipReason) {
        self.skipped_files.push(Skipped::new(path, reason));
    }

    pub fn finish(self) -> Outcome<ChangeCoverage> {
        if self.total_deletions == 0 {
            return Outcome::Skipped {
                reason: SkipReason::NoQualifyingDeletions,
                children: self.skipped_files,
            };
        }
        Outcome::Considered(ChangeCoverage {
            id: self.id,
            author: self.author,
            reviewers: self.reviewers,
            coverage: coverage_ratio(self.total_unapproved_deletions, self.total_deletions),
            total_deletions: self.total_deletions,
            total_unapproved_deletions: self.total_unapproved_deletions,
            unassigned_authors: self.unassigned_authors,
            skipped_files: self.skipped_files,
        })
    }
}

pub struct RepoAccumulator {
    name: String,
    changes: Vec<ChangeCoverage>,
    skipped_changes: Vec<Skipped>,
}

impl RepoAccumulator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            changes: Vec::new(),
            skipped_changes: Vec::new(),
        }
    }

    pub fn record_change(&mut self, name: String, outcome: Outcome<ChangeCoverage>) {
        match outcome {
            Outcome::Considered(change) => self.changes.push(change),
            Outcome::Skipped { reason, children } => self
                .skipped_changes
                .push(Skipped::with_children(name, reason, children)),
        }
    }

    pub fn finish(self) -> Outcome<RepoCoverage> {
        self.finish_or(SkipReason::NoConsideredChildren {
            children: "pull requests",
        })
    }

    /// Like `finish`, but a repository without considered pull requests is
    /// skipped with `empty`.
    pub fn finish_or(self, empty: SkipReason) -> Outcome<RepoCoverage> {
        let Some(coverage) = mean(self.changes.iter().map(|c| c.coverage)) else {
            return Outcome::Skipped {
                reason: empty,
                children: self.skipped_changes,
            };
        };
        Outcome::Considered(RepoCoverage {
            name: self.name,
            coverage,
            changes_considered: self.changes.len(),
            changes: self.changes,
            skipped_changes: self.skipped_changes,
        })
    }
}

pub struct WorkspaceAccumulator {
    name: String,
    repos: Vec<RepoCoverage>,
    skipped_repos: Vec<Skipped>,
}

impl WorkspaceAccumulator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repos: Vec::new(),
            skipped_repos: Vec::new(),
        }
    }

    pub fn record_repo(&mut self, name: String, outcome: Outcome<RepoCoverage>) {
        match outcome {
            Outcome::Considered(repo) => self.repos.push(repo),
            Outcome::Skipped { reason, children } => self
                .skipped_repos
                .push(Skipped::with_children(name, reason, children)),
        }
    }

    pub fn finish(self) -> Outcome<WorkspaceCoverage> {
        self.finish_or(SkipReason::NoConsideredChildren {
            children: "repositories",
        })
    }

    pub fn finish_or(self, empty: SkipReason) -> Outcome<WorkspaceCoverage> {
        let Some(coverage) = mean(self.repos.iter().map(|r| r.coverage)) else {
            return Outcome::Skipped {
                reason: empty,
                children: self.skipped_repos,
            };
        };
        Outcome::Considered(WorkspaceCoverage {
            name: self.name,
            coverage,
            repos_considered: self.repos.len(),
            repos: self.repos,
            skipped_repos: self.skipped_repos,
        })
    }
}

pub struct ReportAccumulator {
    provider: String,
    workspaces: Vec<WorkspaceCoverage>,
    skipped_workspaces: Vec<Skipped>,
}

impl ReportAccumulator {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            workspaces: Vec::new(),
            skipped_workspaces: Vec::new(),
        }
    }

    pub fn record_workspace(&mut self, name: String, outcome: Outcome<WorkspaceCoverage>) {
        match outcome {
            Outcome::Considered(workspace) => self.workspaces.push(workspace),
            Outcome::Skipped { reason, children } => self
                .skipped_workspaces
                .push(Skipped::with_children(name, reason, children)),
        }
    }

    pub fn finish(self, cancelled: bool) -> CoverageReport {
        CoverageReport {
            provider: self.provider,
            coverage: mean(self.workspaces.iter().map(|w| w.coverage)),
            workspaces_considered: self.workspaces.len(),
            workspaces: self.workspaces,
            skipped_workspaces: self.skipped_workspaces,
            cancelled,
        }
    }
}
