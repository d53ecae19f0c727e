//! Sequential driver: workspace → repository → change → file.
//!
//! Every provider fetch is bounded by the configured timeout and raced against
//! the cancellation token. A failing unit becomes a skip entry in its parent
//! and its siblings carry on. On cancellation no new unit starts, the change
//! in flight is dropped, and every enclosing aggregate is finalized from the
//! children it already completed. An aggregate left with none of them is
//! skipped as cancelled.

use std::collections::HashSet;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::aggregate::{
    ChangeAccumulator, Outcome, RepoAccumulator, ReportAccumulator, WorkspaceAccumulator,
};
use crate::blame::{RangeBlame, ReconstructedBlame};
use crate::cache::LookupCache;
use crate::config::CoverageConfig;
use crate::coverage::{
    self, ChangeCoverage, CoverageReport, FileOutcome, RepoCoverage, SkipReason,
    WorkspaceCoverage,
};
use crate::diff::{deleted_lines, DeletedLines};
use crate::source::{
    with_timeout, BlameStrategy, Change, ChangeState, ChangedFile, Identity, Provider, Repository,
    SourceError,
};

/// The run was cancelled while a unit was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Why a unit stopped early.
#[derive(Debug, Clone, PartialEq)]
enum Interrupt {
    Cancelled,
    Skip(SkipReason),
}

impl Interrupt {
    fn into_outcome<T>(self) -> Result<Outcome<T>, Cancelled> {
        match self {
            Interrupt::Skip(reason) => Ok(Outcome::skipped(reason)),
            Interrupt::Cancelled => Err(Cancelled),
        }
    }
}

pub struct Engine<'a> {
    provider: &'a dyn Provider,
    settings: CoverageConfig,
    cancel: CancellationToken,
    repo_filter: Vec<String>,
}

impl<'a> Engine<'a> {
    pub fn new(provider: &'a dyn Provider, settings: CoverageConfig, cancel: CancellationToken) -> Self {
        Self {
            provider,
            settings,
            cancel,
            repo_filter: Vec::new(),
        }
    }

    /// Only score repositories whose slug or `workspace/slug` is listed.
    pub fn with_repo_filter(mut self, repos: Vec<String>) -> Self {
        self.repo_filter = repos;
        self
    }

    fn selected(&self, repo: &Repository) -> bool {
        self.repo_filter.is_empty()
            || self
                .repo_filter
                .iter()
                .any(|wanted| *wanted == repo.slug || *wanted == repo.full_name())
    }

    async fn fetch<T, F>(&self, what: &'static str, fetch: F) -> Result<T, Interrupt>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            result = with_timeout(self.settings.request_timeout(), fetch) => {
                result.map_err(|e| {
                    warn!(what, error = %e, "fetch failed");
                    Interrupt::Skip(SkipReason::Fetch { what, error: e.to_string() })
                })
            }
        }
    }

    /// Score `workspaces`, or every workspace the provider lists when empty.
    pub async fn run(&self, workspaces: &[String]) -> CoverageReport {
        let mut report = ReportAccumulator::new(self.provider.name());

        let workspaces = if workspaces.is_empty() {
            match self.fetch("workspaces", self.provider.workspaces()).await {
                Ok(all) => all,
                Err(Interrupt::Cancelled) => return report.finish(true),
                Err(Interrupt::Skip(reason)) => {
                    report.record_workspace("(all workspaces)".to_string(), Outcome::skipped(reason));
                    return report.finish(false);
                }
            }
        } else {
            workspaces.to_vec()
        };
        info!(count = workspaces.len(), "processing workspaces");

        for workspace in workspaces {
            if self.cancel.is_cancelled() {
                break;
            }
            let outcome = self
                .process_workspace(&workspace)
                .instrument(info_span!("workspace", workspace = %workspace))
                .await;
            report.record_workspace(workspace, outcome);
        }

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            warn!("run cancelled, reporting partial results");
        }
        report.finish(cancelled)
    }

    async fn process_workspace(&self, workspace: &str) -> Outcome<WorkspaceCoverage> {
        let mut acc = WorkspaceAccumulator::new(workspace);

        let repos = match self.fetch("repositories", self.provider.repositories(workspace)).await {
            Ok(repos) => repos,
            Err(Interrupt::Skip(reason)) => return Outcome::skipped(reason),
            Err(Interrupt::Cancelled) => return acc.finish_or(SkipReason::Cancelled),
        };

        for repo in repos.iter().filter(|repo| self.selected(repo)) {
            if self.cancel.is_cancelled() {
                break;
            }
            let outcome = self
                .process_repo(repo)
                .instrument(info_span!("repo", repo = %repo.slug))
                .await;
            acc.record_repo(repo.full_name(), outcome);
        }

        let outcome = if self.cancel.is_cancelled() {
            acc.finish_or(SkipReason::Cancelled)
        } else {
            acc.finish()
        };
        match &outcome {
            Outcome::Considered(ws) => info!(
                coverage = ws.coverage,
                repos = ws.repos_considered,
                "workspace coverage"
            ),
            Outcome::Skipped { reason, .. } => info!(%reason, "workspace skipped"),
        }
        outcome
    }

    async fn process_repo(&self, repo: &Repository) -> Outcome<RepoCoverage> {
        let mut acc = RepoAccumulator::new(&repo.slug);
        let cache = LookupCache::new();

        let changes = match self.fetch("pull requests", self.provider.changes(repo)).await {
            Ok(changes) => changes,
            Err(Interrupt::Skip(reason)) => return Outcome::skipped(reason),
            Err(Interrupt::Cancelled) => return acc.finish_or(SkipReason::Cancelled),
        };
        debug!(changes = changes.len(), "listed pull requests");

        for change in &changes {
            let name = format!("{}#{}", repo.full_name(), change.id);
            let result = self
                .process_change(repo, change, &cache)
                .instrument(info_span!("change", id = change.id))
                .await;
            match result {
                Ok(outcome) => acc.record_change(name, outcome),
                Err(Cancelled) => break,
            }
        }

        let (authors, diffs) = cache.sizes().await;
        debug!(authors, diffs, "dropping lookup cache");

        let outcome = if self.cancel.is_cancelled() {
            acc.finish_or(SkipReason::Cancelled)
        } else {
            acc.finish()
        };
        match &outcome {
            Outcome::Considered(r) => info!(
                coverage = r.coverage,
                changes = r.changes_considered,
                "repository coverage"
            ),
            Outcome::Skipped { reason, .. } => info!(%reason, "repository skipped"),
        }
        outcome
    }

    async fn process_change(
        &self,
        repo: &Repository,
        change: &Change,
        cache: &LookupCache,
    ) -> Result<Outcome<ChangeCoverage>, Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        if change.state != ChangeState::Merged {
            return Ok(Outcome::skipped(SkipReason::NotMerged));
        }

        let reviewers = match self.fetch("reviewers", self.provider.reviewers(repo, change)).await {
            Ok(reviewers) => reviewers,
            Err(interrupt) => return interrupt.into_outcome(),
        };
        let files = match self
            .fetch("changed files", self.provider.changed_files(repo, change))
            .await
        {
            Ok(files) => files,
            Err(interrupt) => return interrupt.into_outcome(),
        };
        debug!(author = %change.author, reviewers = reviewers.len(), files = files.len(), "scoring pull request");

        let mut acc = ChangeAccumulator::new(change, &reviewers);
        for file in &files {
            match self.process_file(repo, change, file, &reviewers, cache).await {
                Ok(outcome) => acc.record_file(&file.path, outcome),
                Err(Interrupt::Skip(reason)) => {
                    debug!(path = %file.path, %reason, "file skipped");
                    acc.skip_file(&file.path, reason);
                }
                Err(Interrupt::Cancelled) => return Err(Cancelled),
            }
        }

        let outcome = acc.finish();
        if let Outcome::Considered(c) = &outcome {
            info!(
                coverage = c.coverage,
                total = c.total_deletions,
                unapproved = c.total_unapproved_deletions,
                "pull request coverage"
            );
        }
        Ok(outcome)
    }

    async fn process_file(
        &self,
        repo: &Repository,
        change: &Change,
        file: &ChangedFile,
        reviewers: &HashSet<Identity>,
        cache: &LookupCache,
    ) -> Result<FileOutcome, Interrupt> {
        if file.old_path.is_none() {
            return Err(Interrupt::Skip(SkipReason::NewFile));
        }
        coverage::size_guard(file, self.settings.max_file_deletions).map_err(Interrupt::Skip)?;

        let diff = self
            .fetch("diff", self.provider.diff(repo, change, file))
            .await?
            .ok_or(Interrupt::Skip(SkipReason::NoPatch))?;
        let lines = deleted_lines(&diff, self.settings.min_line_chars);
        if lines.clone().next().is_none() {
            return Ok(FileOutcome::NoDeletions);
        }

        let scoring = self.score_file(repo, change, file.blame_path(), lines, reviewers, cache);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            outcome = scoring => outcome,
        }
    }

    async fn score_file(
        &self,
        repo: &Repository,
        change: &Change,
        path: &str,
        lines: DeletedLines<'_>,
        reviewers: &HashSet<Identity>,
        cache: &LookupCache,
    ) -> Result<FileOutcome, Interrupt> {
        match self.provider.blame() {
            BlameStrategy::Range(source) => {
                let ranges = self
                    .fetch("blame", source.range_blame(repo, &change.base_revision, path))
                    .await?;
                if ranges.is_empty() {
                    return Err(Interrupt::Skip(SkipReason::NoBlame));
                }
                let resolver = RangeBlame::new(ranges);
                Ok(coverage::calculate(lines, &resolver, reviewers, &change.author).await)
            }
            BlameStrategy::Reconstructed(source) => {
                let commits = self
                    .fetch("file history", source.file_history(repo, &change.base_revision, path))
                    .await?;
                if commits.is_empty() {
                    return Err(Interrupt::Skip(SkipReason::NoHistory));
                }
                let resolver = ReconstructedBlame::new(
                    source,
                    cache,
                    repo,
                    path,
                    commits,
                    self.settings.min_line_chars,
                )
                .with_timeout(self.settings.request_timeout());
                Ok(coverage::calculate(lines, &resolver, reviewers, &change.author).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::MockProvider;

    const DEMO: &str = include_str!("../tests/fixtures/demo.json");
    const HISTORY: &str = include_str!("../tests/fixtures/history.json");

    fn settings() -> CoverageConfig {
        CoverageConfig::default()
    }

    fn demo() -> MockProvider {
        MockProvider::from_json(DEMO).unwrap()
    }

    fn workspace<'r>(report: &'r CoverageReport, name: &str) -> &'r WorkspaceCoverage {
        report
            .workspaces
            .iter()
            .find(|w| w.name == name)
            .unwrap_or_else(|| panic!("workspace {name} missing"))
    }

    #[tokio::test]
    async fn test_demo_report_tree() {
        let provider = demo();
        let report = Engine::new(&provider, settings(), CancellationToken::new())
            .run(&[])
            .await;

        assert!(!report.cancelled);
        assert_eq!(report.provider, "mock");
        assert_eq!(report.workspaces_considered, 2);

        let acme = workspace(&report, "acme");
        assert_eq!(acme.repos_considered, 1);
        let widgets = &acme.repos[0];
        assert_eq!(widgets.name, "widgets");

        // PR 1: both removed lines by carol, reviewer alice, author bob.
        let pr1 = widgets.changes.iter().find(|c| c.id == 1).unwrap();
        assert_eq!(pr1.total_deletions, 2);
        assert_eq!(pr1.total_unapproved_deletions, 2);
        assert_eq!(pr1.coverage, 0.0);
        assert!(pr1.unassigned_authors.contains("carol"));

        // PR 2: the author's own line drops out; carol's is unapproved and
        // alice's is approved.
        let pr2 = widgets.changes.iter().find(|c| c.id == 2).unwrap();
        assert_eq!(pr2.total_deletions, 2);
        assert_eq!(pr2.total_unapproved_deletions, 1);
        assert!((pr2.coverage - 0.5).abs() < 1e-9);

        // PR 3 is open; PR 4 only has a file over the size ceiling.
        let skipped: Vec<&str> = widgets.skipped_changes.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["acme/widgets#3", "acme/widgets#4"]);
        assert_eq!(widgets.skipped_changes[0].reason, SkipReason::NotMerged);
        assert_eq!(widgets.changes_considered, 2);
        assert!((widgets.coverage - 0.25).abs() < 1e-9);

        // The repository with only self-authored deletions does not count.
        assert_eq!(acme.skipped_repos.len(), 1);
        assert_eq!(acme.skipped_repos[0].name, "acme/docs");
        assert!((acme.coverage - widgets.coverage).abs() < 1e-9);

        // Beta: the new file and the file without a patch are skipped.
        let beta = workspace(&report, "beta");
        assert_eq!(beta.coverage, 1.0);
        let tools = &beta.repos[0].changes[0];
        let reasons: Vec<&SkipReason> = tools.skipped_files.iter().map(|s| &s.reason).collect();
        assert_eq!(reasons, vec![&SkipReason::NewFile, &SkipReason::NoPatch]);

        assert!((report.coverage.unwrap() - 0.625).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_oversized_file_skipped_before_fetch() {
        let provider = demo();
        let report = Engine::new(&provider, settings(), CancellationToken::new())
            .run(&["acme".to_string()])
            .await;
        let widgets = &workspace(&report, "acme").repos[0];
        let pr4 = &widgets.skipped_changes[1];
        assert_eq!(pr4.name, "acme/widgets#4");
        assert_eq!(pr4.reason, SkipReason::NoQualifyingDeletions);
        assert_eq!(pr4.skipped.len(), 1);
        assert_eq!(pr4.skipped[0].name, "huge.rs");
        assert!(matches!(
            pr4.skipped[0].reason,
            SkipReason::TooManyDeletions { limit: 2000, .. }
        ));
        assert_eq!(provider.fetch_counts().diffs_for("huge.rs"), 0);

        let json = serde_json::to_value(&report).unwrap();
        let skipped_pr = &json["workspaces"][0]["repositories"][0]["skipped_changes"][1];
        assert_eq!(skipped_pr["skipped"][0]["name"], "huge.rs");
    }

    #[tokio::test]
    async fn test_file_failure_is_sibling_safe() {
        let mut provider = demo();
        provider.fail_diff("src/lib.rs");
        let report = Engine::new(&provider, settings(), CancellationToken::new())
            .run(&["acme".to_string()])
            .await;
        let widgets = &workspace(&report, "acme").repos[0];
        let pr2 = widgets.changes.iter().find(|c| c.id == 2).unwrap();
        assert!(pr2
            .skipped_files
            .iter()
            .any(|s| s.name == "src/lib.rs" && matches!(s.reason, SkipReason::Fetch { .. })));
        assert_eq!(pr2.total_deletions, 1);
    }

    #[tokio::test]
    async fn test_repo_failure_is_sibling_safe() {
        let mut provider = demo();
        provider.fail_changes("acme", "docs");
        let report = Engine::new(&provider, settings(), CancellationToken::new())
            .run(&["acme".to_string()])
            .await;
        let acme = workspace(&report, "acme");
        assert_eq!(acme.repos_considered, 1);
        assert!(matches!(
            acme.skipped_repos[0].reason,
            SkipReason::Fetch { what: "pull requests", .. }
        ));
    }

    #[tokio::test]
    async fn test_repo_filter() {
        let provider = demo();
        let report = Engine::new(&provider, settings(), CancellationToken::new())
            .with_repo_filter(vec!["acme/docs".to_string()])
            .run(&["acme".to_string()])
            .await;
        assert_eq!(report.workspaces_considered, 0);
        assert_eq!(report.skipped_workspaces[0].name, "acme");
    }

    #[tokio::test]
    async fn test_reconstructed_workspace_uses_history() {
        let provider = MockProvider::from_json(HISTORY).unwrap();
        let report = Engine::new(&provider, settings(), CancellationToken::new())
            .run(&[])
            .await;
        let service = &workspace(&report, "team").repos[0];

        // PR 10: two lines by the reviewer, one by the author, one unknown.
        let pr10 = service.changes.iter().find(|c| c.id == 10).unwrap();
        assert_eq!(pr10.total_deletions, 2);
        assert_eq!(pr10.total_unapproved_deletions, 0);
        assert_eq!(pr10.coverage, 1.0);

        // PR 11: nobody reviewed hank's line.
        let pr11 = service.changes.iter().find(|c| c.id == 11).unwrap();
        assert_eq!(pr11.coverage, 0.0);
        assert!(pr11.unassigned_authors.contains("hank"));
        assert!((service.coverage - 0.5).abs() < 1e-9);

        // Each commit's diff and author is fetched once for the whole repository.
        let counts = provider.fetch_counts();
        assert_eq!(counts.commit_diffs, 2);
        assert_eq!(counts.commit_authors, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_empty_partial() {
        let provider = demo();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Engine::new(&provider, settings(), cancel).run(&[]).await;
        assert!(report.cancelled);
        assert_eq!(report.workspaces_considered, 0);
        assert_eq!(report.coverage, None);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_finished_units() {
        let mut provider = demo();
        let cancel = CancellationToken::new();
        // Cancel as soon as the beta workspace starts listing repositories.
        provider.cancel_on_repositories("beta", cancel.clone());
        let report = Engine::new(&provider, settings(), cancel)
            .run(&["acme".to_string(), "beta".to_string()])
            .await;
        assert!(report.cancelled);
        assert_eq!(report.workspaces_considered, 1);
        assert_eq!(report.workspaces[0].name, "acme");
        assert_eq!(report.skipped_workspaces.len(), 1);
        assert_eq!(report.skipped_workspaces[0].name, "beta");
        assert_eq!(report.skipped_workspaces[0].reason, SkipReason::Cancelled);
        assert_eq!(report.coverage, Some(report.workspaces[0].coverage));
    }
}
