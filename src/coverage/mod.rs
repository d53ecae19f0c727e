pub mod types;

pub use types::{
    ChangeCoverage, CoverageReport, FileCoverage, FileOutcome, RepoCoverage, SkipReason, Skipped,
    WorkspaceCoverage,
};

use std::collections::HashSet;

use tracing::debug;

use crate::blame::BlameResolver;
use crate::diff::DeletedLine;
use crate::source::{ChangedFile, Identity};

/// Default ceiling on a file's removed-line count.
pub const DEFAULT_MAX_FILE_DELETIONS: usize = 2000;

/// `1.0` when nothing is unapproved, otherwise `1 - unapproved / total`.
pub fn coverage_ratio(unapproved: usize, total: usize) -> f64 {
    if unapproved == 0 || total == 0 {
        1.0
    } else {
        1.0 - unapproved as f64 / total as f64
    }
}

/// Reject files whose reported removed-line count exceeds `limit`, before any
/// diff or blame is fetched for them.
pub fn size_guard(file: &ChangedFile, limit: usize) -> Result<(), SkipReason> {
    if file.deletions > limit {
        return Err(SkipReason::TooManyDeletions {
            deletions: file.deletions,
            limit,
        });
    }
    Ok(())
}

/// Score the deleted lines of one file.
///
/// Unattributed lines and lines the change author wrote are left out of both
/// counts. Every other line is a qualifying deletion, unapproved when its
/// author is not a reviewer.
pub async fn calculate<I>(
    lines: I,
    resolver: &dyn BlameResolver,
    reviewers: &HashSet<Identity>,
    change_author: &str,
) -> FileOutcome
where
    I: IntoIterator<Item = DeletedLine>,
{
    let mut coverage = FileCoverage::default();
    let mut unattributed = 0usize;
    let mut self_authored = 0usize;

    for line in lines {
        let Some(author) = resolver.resolve(&line).await else {
            debug!(line = line.old_line, text = %line.text, "no blame author, treated as approved");
            unattributed += 1;
            continue;
        };
        if author == change_author {
            self_authored += 1;
            continue;
        }
        coverage.total_deletions += 1;
        if !reviewers.contains(&author) {
            coverage.unapproved_deletions += 1;
            coverage.unassigned_authors.insert(author);
        }
    }

    debug!(
        total = coverage.total_deletions,
        unapproved = coverage.unapproved_deletions,
        unattributed,
        self_authored,
        "scored file"
    );

    if coverage.total_deletions == 0 {
        FileOutcome::NoDeletions
    } else {
        FileOutcome::Counted(coverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::blame::RangeBlame;
    use crate::diff::{deleted_lines, DEFAULT_MIN_LINE_CHARS};
    use crate::source::BlameRange;

    const HUNK: &str = "@@ -10,3 +10,2 @@\n keep\n-removed line text\n-another removed\n";

    fn reviewers(names: &[&str]) -> HashSet<Identity> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn blame(ranges: &[(usize, usize, &str)]) -> RangeBlame {
        RangeBlame::new(
            ranges
                .iter()
                .map(|(start, end, author)| BlameRange {
                    start_line: *start,
                    end_line: *end,
                    author: Some(author.to_string()),
                })
                .collect(),
        )
    }

    /// Helper to build a ChangedFile with only a removed-line count.
    fn changed_file(deletions: usize) -> ChangedFile {
        ChangedFile {
            path: "src/big.rs".to_string(),
            old_path: Some("src/big.rs".to_string()),
            deletions,
            patch: None,
        }
    }

    #[tokio::test]
    async fn test_unreviewed_author_is_unapproved() {
        let resolver = blame(&[(1, 20, "carol")]);
        let outcome = calculate(
            deleted_lines(HUNK, DEFAULT_MIN_LINE_CHARS),
            &resolver,
            &reviewers(&["alice"]),
            "bob",
        )
        .await;
        let FileOutcome::Counted(file) = outcome else {
            panic!("expected counted outcome");
        };
        assert_eq!(file.unapproved_deletions, 2);
        assert_eq!(file.total_deletions, 2);
        assert_eq!(file.unassigned_authors, BTreeSet::from(["carol".to_string()]));
        assert_eq!(coverage_ratio(file.unapproved_deletions, file.total_deletions), 0.0);
    }

    #[tokio::test]
    async fn test_self_authored_line_is_excluded() {
        let resolver = blame(&[(11, 11, "bob"), (12, 12, "carol")]);
        let outcome = calculate(
            deleted_lines(HUNK, DEFAULT_MIN_LINE_CHARS),
            &resolver,
            &reviewers(&["alice"]),
            "bob",
        )
        .await;
        let FileOutcome::Counted(file) = outcome else {
            panic!("expected counted outcome");
        };
        assert_eq!(file.total_deletions, 1);
        assert_eq!(file.unapproved_deletions, 1);
    }

    #[tokio::test]
    async fn test_reviewer_authored_lines_are_approved() {
        let resolver = blame(&[(1, 20, "alice")]);
        let outcome = calculate(
            deleted_lines(HUNK, DEFAULT_MIN_LINE_CHARS),
            &resolver,
            &reviewers(&["alice"]),
            "bob",
        )
        .await;
        let FileOutcome::Counted(file) = outcome else {
            panic!("expected counted outcome");
        };
        assert_eq!(file.unapproved_deletions, 0);
        assert!(file.unassigned_authors.is_empty());
        assert_eq!(coverage_ratio(file.unapproved_deletions, file.total_deletions), 1.0);
    }

    #[tokio::test]
    async fn test_only_self_or_unattributed_lines_means_no_deletions() {
        let resolver = blame(&[(11, 11, "bob")]);
        let outcome = calculate(
            deleted_lines(HUNK, DEFAULT_MIN_LINE_CHARS),
            &resolver,
            &reviewers(&["alice"]),
            "bob",
        )
        .await;
        assert_eq!(outcome, FileOutcome::NoDeletions);
    }

    #[test]
    fn test_coverage_ratio_bounds() {
        assert_eq!(coverage_ratio(0, 5), 1.0);
        assert_eq!(coverage_ratio(5, 5), 0.0);
        assert!((coverage_ratio(1, 4) - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_size_guard() {
        assert!(size_guard(&changed_file(2000), DEFAULT_MAX_FILE_DELETIONS).is_ok());
        assert_eq!(
            size_guard(&changed_file(2500), DEFAULT_MAX_FILE_DELETIONS),
            Err(SkipReason::TooManyDeletions { deletions: 2500, limit: 2000 })
        );
    }
}
