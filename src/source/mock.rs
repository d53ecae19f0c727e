//! In-memory provider loaded from JSON.
//!
//! Drives `--mock` runs and tests without network access. Blame ranges and
//! file histories are keyed by path only: every revision of a repository sees
//! the same attribution.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
#[cfg(test)]
use tokio_util::sync::CancellationToken;

use super::{
    BlameRange, BlameStrategy, CatalogSource, Change, ChangeState, ChangedFile, CommitRef,
    DiffSource, HistoryBlameSource, Identity, Provider, RangeBlameSource, Repository,
    ReviewerSource, SourceError,
};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockStrategy {
    Range,
    Reconstructed,
}

#[derive(Debug, Deserialize)]
struct MockData {
    #[serde(default = "default_name")]
    name: String,
    strategy: MockStrategy,
    workspaces: Vec<MockWorkspace>,
}

fn default_name() -> String {
    "mock".to_string()
}

#[derive(Debug, Deserialize)]
struct MockWorkspace {
    name: String,
    repos: Vec<MockRepo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MockRepo {
    slug: String,
    changes: Vec<MockChange>,
    blame: Vec<MockBlame>,
    history: Vec<MockHistory>,
    commits: Vec<MockCommit>,
}

#[derive(Debug, Deserialize)]
struct MockChange {
    id: u64,
    author: Identity,
    state: ChangeState,
    base: String,
    head: String,
    #[serde(default)]
    reviewers: Vec<Identity>,
    #[serde(default)]
    files: Vec<MockFile>,
}

#[derive(Debug, Deserialize)]
struct MockFile {
    path: String,
    #[serde(default)]
    old_path: Option<String>,
    #[serde(default)]
    new_file: bool,
    deletions: usize,
    #[serde(default)]
    diff: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MockBlame {
    path: String,
    ranges: Vec<MockRange>,
}

#[derive(Debug, Deserialize)]
struct MockRange {
    start: usize,
    end: usize,
    author: Option<Identity>,
}

#[derive(Debug, Deserialize)]
struct MockHistory {
    path: String,
    commits: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MockCommit {
    hash: String,
    author: Option<Identity>,
    #[serde(default)]
    diffs: HashMap<String, String>,
}

/// Snapshot of how often the provider was asked for each kind of data.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct FetchCounts {
    pub commit_diffs: usize,
    pub commit_authors: usize,
    pub diffs: HashMap<String, usize>,
}

#[cfg(test)]
impl FetchCounts {
    pub fn diffs_for(&self, path: &str) -> usize {
        self.diffs.get(path).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct Counters {
    commit_diffs: AtomicUsize,
    commit_authors: AtomicUsize,
    diffs: Mutex<HashMap<String, usize>>,
}

pub struct MockProvider {
    name: String,
    strategy: MockStrategy,
    workspaces: Vec<MockWorkspace>,
    failing_diffs: HashSet<String>,
    failing_changes: HashSet<String>,
    #[cfg(test)]
    cancel_on_repositories: Option<(String, CancellationToken)>,
    counters: Counters,
}

impl MockProvider {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let data: MockData = serde_json::from_str(json)?;
        Ok(Self::from_data(data))
    }

    fn from_data(data: MockData) -> Self {
        Self {
            name: data.name,
            strategy: data.strategy,
            workspaces: data.workspaces,
            failing_diffs: HashSet::new(),
            failing_changes: HashSet::new(),
            #[cfg(test)]
            cancel_on_repositories: None,
            counters: Counters::default(),
        }
    }

    /// Single-repository provider whose `path` history is the given
    /// `(hash, author, diff)` commits, in order.
    #[cfg(test)]
    pub fn with_history(repo: &Repository, path: &str, commits: Vec<(&str, &str, &str)>) -> Self {
        let history = MockHistory {
            path: path.to_string(),
            commits: commits.iter().map(|(hash, _, _)| hash.to_string()).collect(),
        };
        let commits = commits
            .into_iter()
            .map(|(hash, author, diff)| MockCommit {
                hash: hash.to_string(),
                author: Some(author.to_string()),
                diffs: HashMap::from([(path.to_string(), diff.to_string())]),
            })
            .collect();
        Self::from_data(MockData {
            name: default_name(),
            strategy: MockStrategy::Reconstructed,
            workspaces: vec![MockWorkspace {
                name: repo.workspace.clone(),
                repos: vec![MockRepo {
                    slug: repo.slug.clone(),
                    history: vec![history],
                    commits,
                    ..MockRepo::default()
                }],
            }],
        })
    }

    /// Make every diff request for `path` fail.
    #[cfg(test)]
    pub fn fail_diff(&mut self, path: &str) {
        self.failing_diffs.insert(path.to_string());
    }

    /// Make listing the changes of `workspace/slug` fail.
    #[cfg(test)]
    pub fn fail_changes(&mut self, workspace: &str, slug: &str) {
        self.failing_changes.insert(format!("{workspace}/{slug}"));
    }

    /// Cancel `token` when the repositories of `workspace` are listed.
    #[cfg(test)]
    pub fn cancel_on_repositories(&mut self, workspace: &str, token: CancellationToken) {
        self.cancel_on_repositories = Some((workspace.to_string(), token));
    }

    #[cfg(test)]
    pub fn fetch_counts(&self) -> FetchCounts {
        FetchCounts {
            commit_diffs: self.counters.commit_diffs.load(Ordering::SeqCst),
            commit_authors: self.counters.commit_authors.load(Ordering::SeqCst),
            diffs: self
                .counters
                .diffs
                .lock()
                .map(|diffs| diffs.clone())
                .unwrap_or_default(),
        }
    }

    fn workspace(&self, name: &str) -> Result<&MockWorkspace, SourceError> {
        self.workspaces
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| SourceError::NotFound(format!("workspace {name}")))
    }

    fn repo(&self, repo: &Repository) -> Result<&MockRepo, SourceError> {
        self.workspace(&repo.workspace)?
            .repos
            .iter()
            .find(|r| r.slug == repo.slug)
            .ok_or_else(|| SourceError::NotFound(format!("repository {}", repo.full_name())))
    }

    fn change(&self, repo: &Repository, id: u64) -> Result<&MockChange, SourceError> {
        self.repo(repo)?
            .changes
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| SourceError::NotFound(format!("pull request {id}")))
    }

    fn commit(&self, repo: &Repository, hash: &str) -> Result<&MockCommit, SourceError> {
        self.repo(repo)?
            .commits
            .iter()
            .find(|c| c.hash == hash)
            .ok_or_else(|| SourceError::NotFound(format!("commit {hash}")))
    }

    fn injected_failure(what: &str) -> SourceError {
        SourceError::Status {
            status: 500,
            url: format!("mock://{what}"),
            body: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl CatalogSource for MockProvider {
    async fn workspaces(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.workspaces.iter().map(|w| w.name.clone()).collect())
    }

    async fn repositories(&self, workspace: &str) -> Result<Vec<Repository>, SourceError> {
        #[cfg(test)]
        if let Some((target, token)) = &self.cancel_on_repositories {
            if target == workspace {
                token.cancel();
            }
        }
        Ok(self
            .workspace(workspace)?
            .repos
            .iter()
            .map(|r| Repository::new(workspace, r.slug.clone()))
            .collect())
    }

    async fn changes(&self, repo: &Repository) -> Result<Vec<Change>, SourceError> {
        if self.failing_changes.contains(&repo.full_name()) {
            return Err(Self::injected_failure("changes"));
        }
        Ok(self
            .repo(repo)?
            .changes
            .iter()
            .map(|c| Change {
                id: c.id,
                author: c.author.clone(),
                state: c.state,
                base_revision: c.base.clone(),
                head_revision: c.head.clone(),
            })
            .collect())
    }

    async fn changed_files(
        &self,
        repo: &Repository,
        change: &Change,
    ) -> Result<Vec<ChangedFile>, SourceError> {
        Ok(self
            .change(repo, change.id)?
            .files
            .iter()
            .map(|f| ChangedFile {
                path: f.path.clone(),
                old_path: if f.new_file {
                    None
                } else {
                    Some(f.old_path.clone().unwrap_or_else(|| f.path.clone()))
                },
                deletions: f.deletions,
                patch: f.diff.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl DiffSource for MockProvider {
    async fn diff(
        &self,
        _repo: &Repository,
        _change: &Change,
        file: &ChangedFile,
    ) -> Result<Option<String>, SourceError> {
        if let Ok(mut diffs) = self.counters.diffs.lock() {
            *diffs.entry(file.path.clone()).or_default() += 1;
        }
        if self.failing_diffs.contains(&file.path) {
            return Err(Self::injected_failure("diff"));
        }
        Ok(file.patch.clone())
    }
}

#[async_trait]
impl ReviewerSource for MockProvider {
    async fn reviewers(
        &self,
        repo: &Repository,
        change: &Change,
    ) -> Result<HashSet<Identity>, SourceError> {
        Ok(self
            .change(repo, change.id)?
            .reviewers
            .iter()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RangeBlameSource for MockProvider {
    async fn range_blame(
        &self,
        repo: &Repository,
        _revision: &str,
        path: &str,
    ) -> Result<Vec<BlameRange>, SourceError> {
        Ok(self
            .repo(repo)?
            .blame
            .iter()
            .filter(|b| b.path == path)
            .flat_map(|b| &b.ranges)
            .map(|r| BlameRange {
                start_line: r.start,
                end_line: r.end,
                author: r.author.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl HistoryBlameSource for MockProvider {
    async fn file_history(
        &self,
        repo: &Repository,
        _revision: &str,
        path: &str,
    ) -> Result<Vec<CommitRef>, SourceError> {
        Ok(self
            .repo(repo)?
            .history
            .iter()
            .filter(|h| h.path == path)
            .flat_map(|h| &h.commits)
            .map(|hash| CommitRef::new(hash.as_str()))
            .collect())
    }

    async fn commit_diff(
        &self,
        repo: &Repository,
        commit: &CommitRef,
        path: &str,
    ) -> Result<String, SourceError> {
        self.counters.commit_diffs.fetch_add(1, Ordering::SeqCst);
        self.commit(repo, &commit.hash)?
            .diffs
            .get(path)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("diff of {path} in {}", commit.hash)))
    }

    async fn commit_author(
        &self,
        repo: &Repository,
        commit: &CommitRef,
    ) -> Result<Option<Identity>, SourceError> {
        self.counters.commit_authors.fetch_add(1, Ordering::SeqCst);
        Ok(self.commit(repo, &commit.hash)?.author.clone())
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn blame(&self) -> BlameStrategy<'_> {
        match self.strategy {
            MockStrategy::Range => BlameStrategy::Range(self),
            MockStrategy::Reconstructed => BlameStrategy::Reconstructed(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = include_str!("../../tests/fixtures/demo.json");

    #[tokio::test]
    async fn test_demo_fixture_loads() {
        let provider = MockProvider::from_json(DEMO).unwrap();
        let workspaces = provider.workspaces().await.unwrap();
        assert_eq!(workspaces, vec!["acme".to_string(), "beta".to_string()]);
        assert!(matches!(provider.blame(), BlameStrategy::Range(_)));
    }

    #[tokio::test]
    async fn test_new_file_has_no_old_path() {
        let provider = MockProvider::from_json(DEMO).unwrap();
        let repo = Repository::new("beta", "tools");
        let change = provider.changes(&repo).await.unwrap().remove(0);
        let files = provider.changed_files(&repo, &change).await.unwrap();
        assert!(files.iter().any(|f| f.old_path.is_none()));
    }

    #[tokio::test]
    async fn test_unknown_repository_is_not_found() {
        let provider = MockProvider::from_json(DEMO).unwrap();
        let missing = Repository::new("acme", "nope");
        assert!(matches!(
            provider.changes(&missing).await,
            Err(SourceError::NotFound(_))
        ));
    }
}
