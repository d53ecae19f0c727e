use crate::coverage::{CoverageReport, Skipped};
use colored::Colorize;
use std::fmt::Display;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    FileWrite(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Print the summary to the terminal and, when `output_path` is given, write
/// the full report tree there as JSON.
#[instrument(skip(report), fields(provider = %report.provider, cancelled = report.cancelled))]
pub fn output(report: &CoverageReport, output_path: Option<&Path>) -> Result<(), ReportError> {
    debug!("writing report to terminal");
    print!("{}", render_terminal(report));

    if let Some(path) = output_path {
        debug!(path = %path.display(), "writing report to file");
        write_json_report(report, path)?;
    }
    Ok(())
}

/// Terminal summary, one line per considered unit:
///
/// [Workspace: acme] coverage: 25.00% across 1 repositories
///   [Repo: widgets] coverage: 25.00% across 2 pull requests
///     [PR: 1] coverage: 0.00%
fn render_terminal(report: &CoverageReport) -> String {
    let mut out = String::from("\n");

    if report.cancelled {
        push_line(&mut out, "Run cancelled, results are partial.".yellow().bold());
    }

    for workspace in &report.workspaces {
        push_line(
            &mut out,
            format!(
                "[Workspace: {}] coverage: {} across {} repositories",
                workspace.name.bold(),
                colorize_coverage(workspace.coverage),
                workspace.repos_considered
            ),
        );
        for repo in &workspace.repos {
            push_line(
                &mut out,
                format!(
                    "  [Repo: {}] coverage: {} across {} pull requests",
                    repo.name,
                    colorize_coverage(repo.coverage),
                    repo.changes_considered
                ),
            );
            for change in &repo.changes {
                push_line(
                    &mut out,
                    format!("    [PR: {}] coverage: {}", change.id, colorize_coverage(change.coverage)),
                );
            }
            write_skipped(&mut out, "    ", "pull requests", &repo.skipped_changes);
        }
        write_skipped(&mut out, "  ", "repositories", &workspace.skipped_repos);
    }
    write_skipped(&mut out, "", "workspaces", &report.skipped_workspaces);

    out.push('\n');
    push_line(&mut out, format!("Workspaces analyzed: {}", report.workspaces_considered));
    match report.coverage {
        Some(coverage) => push_line(
            &mut out,
            format!("Total coverage across all workspaces: {}", colorize_coverage(coverage)),
        ),
        None => push_line(&mut out, "No workspaces with coverage.".yellow()),
    }
    out
}

fn push_line(out: &mut String, text: impl Display) {
    out.push_str(&text.to_string());
    out.push('\n');
}

fn write_skipped(out: &mut String, indent: &str, label: &str, skipped: &[Skipped]) {
    if skipped.is_empty() {
        return;
    }
    push_line(out, format!("{indent}{}", format!("Skipped {label}: {}", skipped.len()).dimmed()));
    write_skip_entries(out, &format!("{indent}  "), skipped);
}

/// One line per entry, with each entry's own skipped children nested below it.
fn write_skip_entries(out: &mut String, indent: &str, skipped: &[Skipped]) {
    for entry in skipped {
        push_line(
            out,
            format!("{indent}{}", format!("- {}: {}", entry.name, entry.reason).dimmed()),
        );
        write_skip_entries(out, &format!("{indent}  "), &entry.skipped);
    }
}

fn write_json_report(report: &CoverageReport, path: &Path) -> Result<(), ReportError> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn format_percent(coverage: f64) -> String {
    format!("{:.2}%", coverage * 100.0)
}

/// Helper to colorize a coverage ratio for terminal output.
fn colorize_coverage(coverage: f64) -> colored::ColoredString {
    let text = format_percent(coverage);
    if coverage >= 0.8 {
        text.green().bold()
    } else if coverage >= 0.5 {
        text.yellow().bold()
    } else {
        text.red().bold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{ChangeCoverage, RepoCoverage, SkipReason, WorkspaceCoverage};
    use std::collections::BTreeSet;

    fn sample_report() -> CoverageReport {
        let change = ChangeCoverage {
            id: 1,
            author: "bob".to_string(),
            reviewers: BTreeSet::from(["alice".to_string()]),
            total_deletions: 4,
            total_unapproved_deletions: 1,
            unassigned_authors: BTreeSet::from(["carol".to_string()]),
            coverage: 0.75,
            skipped_files: vec![Skipped::new("logo.png", SkipReason::NoPatch)],
        };
        let repo = RepoCoverage {
            name: "widgets".to_string(),
            coverage: 0.75,
            changes_considered: 1,
            changes: vec![change],
            skipped_changes: vec![
                Skipped::new("acme/widgets#2", SkipReason::NotMerged),
                Skipped::with_children(
                    "acme/widgets#4",
                    SkipReason::NoQualifyingDeletions,
                    vec![Skipped::new(
                        "huge.rs",
                        SkipReason::TooManyDeletions { deletions: 2500, limit: 2000 },
                    )],
                ),
            ],
        };
        CoverageReport {
            provider: "mock".to_string(),
            coverage: Some(0.75),
            workspaces_considered: 1,
            workspaces: vec![WorkspaceCoverage {
                name: "acme".to_string(),
                coverage: 0.75,
                repos_considered: 1,
                repos: vec![repo],
                skipped_repos: vec![],
            }],
            skipped_workspaces: vec![],
            cancelled: false,
        }
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(0.625), "62.50%");
        assert_eq!(format_percent(1.0), "100.00%");
    }

    #[test]
    fn test_render_terminal_summary() {
        let text = render_terminal(&sample_report());
        assert!(text.contains("across 1 repositories"));
        assert!(text.contains("[Repo: widgets]"));
        assert!(text.contains("[PR: 1] coverage:"));
        assert!(text.contains("75.00%"));
        assert!(text.contains("acme/widgets#2: not merged"));
        assert!(text.contains("huge.rs: 2500 deletions exceeds the limit of 2000"));
        assert!(text.contains("Total coverage across all workspaces"));
        assert!(text.ends_with('\n'));
        assert!(text.contains("Workspaces analyzed: 1"));
        assert!(!text.contains("cancelled"));
    }

    #[test]
    fn test_render_cancelled_empty_report() {
        let report = CoverageReport {
            provider: "mock".to_string(),
            coverage: None,
            workspaces_considered: 0,
            workspaces: vec![],
            skipped_workspaces: vec![],
            cancelled: true,
        };
        let text = render_terminal(&report);
        assert!(text.starts_with('\n'));
        assert!(text.contains("Run cancelled"));
        assert!(text.contains("No workspaces with coverage."));
    }

    #[test]
    fn test_write_json_report() {
        let path = std::env::temp_dir().join("review-coverage-test-report.json");
        write_json_report(&sample_report(), &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        let pr = &json["workspaces"][0]["repositories"][0]["pull_requests"][0];
        assert_eq!(pr["relevant_authors_who_did_not_review"][0], "carol");
        assert_eq!(pr["skipped_files"][0]["reason"], "no text patch available");
        assert_eq!(json["coverage"], 0.75);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_output_to_file() {
        let path = std::env::temp_dir().join("review-coverage-test-output.json");
        output(&sample_report(), Some(&path)).unwrap();
        assert!(path.exists());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_output_to_missing_directory_fails() {
        let path = std::env::temp_dir()
            .join("review-coverage-no-such-dir")
            .join("report.json");
        assert!(matches!(
            output(&sample_report(), Some(&path)),
            Err(ReportError::FileWrite(_))
        ));
    }
}
