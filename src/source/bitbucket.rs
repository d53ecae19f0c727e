//! Bitbucket Cloud adapter (REST 2.0, app-password basic auth).
//!
//! Bitbucket has no blame API, so attribution is reconstructed from file
//! history. Every list endpoint pages through `next` links.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{
    checked_json, checked_text, BlameStrategy, CatalogSource, Change, ChangeState, ChangedFile,
    CommitRef, DiffSource, HistoryBlameSource, Identity, Provider, Repository, ReviewerSource,
    SourceError,
};
use crate::config::Config;

const USER_AGENT: &str = "review-coverage";

#[derive(Debug, Deserialize)]
struct Page<T> {
    values: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Slugged {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct User {
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct HashOnly {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    commit: HashOnly,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    id: u64,
    state: ChangeState,
    author: Option<User>,
    source: Endpoint,
    destination: Endpoint,
    #[serde(default)]
    merge_commit: Option<HashOnly>,
}

#[derive(Debug, Deserialize)]
struct Activity {
    #[serde(default)]
    update: Option<ActivityUpdate>,
    #[serde(default)]
    approval: Option<ActivityApproval>,
}

#[derive(Debug, Deserialize)]
struct ActivityUpdate {
    #[serde(default)]
    reviewers: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct ActivityApproval {
    user: User,
}

#[derive(Debug, Deserialize)]
struct DiffStat {
    #[serde(default)]
    lines_removed: usize,
    old: Option<PathEntry>,
    new: Option<PathEntry>,
}

#[derive(Debug, Deserialize)]
struct PathEntry {
    path: String,
}

impl DiffStat {
    fn into_changed_file(self) -> Option<ChangedFile> {
        let old_path = self.old.map(|p| p.path);
        let path = self.new.map(|p| p.path).or_else(|| old_path.clone())?;
        Some(ChangedFile {
            path,
            old_path,
            deletions: self.lines_removed,
            patch: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileHistoryEntry {
    commit: HashOnly,
}

#[derive(Debug, Deserialize)]
struct Commit {
    author: CommitAuthor,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    #[serde(default)]
    user: Option<User>,
}

/// Reviewers named in an activity page: anyone added as a reviewer plus
/// anyone who approved.
fn activity_reviewers(activities: Vec<Activity>) -> impl Iterator<Item = Identity> {
    activities.into_iter().flat_map(|activity| {
        let added = activity
            .update
            .map(|u| u.reviewers)
            .unwrap_or_default()
            .into_iter()
            .map(|user| user.display_name);
        let approver = activity.approval.map(|a| a.user.display_name);
        added.chain(approver)
    })
}

pub struct BitbucketProvider {
    client: reqwest::Client,
    username: String,
    app_password: String,
    api_url: Url,
}

impl BitbucketProvider {
    pub fn new(config: &Config) -> Result<Self, SourceError> {
        let username = config.bitbucket.username.clone().ok_or(
            SourceError::MissingCredentials("Bitbucket username (set BITBUCKET_USERNAME)"),
        )?;
        let app_password = config.bitbucket.app_password.clone().ok_or(
            SourceError::MissingCredentials("Bitbucket app password (set BITBUCKET_APP_PASSWORD)"),
        )?;
        let api_url = Url::parse(config.bitbucket_api_url())
            .map_err(|e| SourceError::InvalidUrl(format!("{}: {e}", config.bitbucket_api_url())))?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.coverage.request_timeout())
            .build()?;
        Ok(Self {
            client,
            username,
            app_password,
            api_url,
        })
    }

    /// API root joined with percent-encoded `segments`.
    fn url<'s>(&self, segments: impl IntoIterator<Item = &'s str>) -> Result<Url, SourceError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(self.api_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn repo_url<'s>(
        &self,
        repo: &'s Repository,
        rest: impl IntoIterator<Item = &'s str>,
    ) -> Result<Url, SourceError> {
        self.url(
            ["repositories", repo.workspace.as_str(), repo.slug.as_str()]
                .into_iter()
                .chain(rest),
        )
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, SourceError> {
        Ok(self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.app_password))
            .send()
            .await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        checked_json(self.get(url).await?).await
    }

    async fn get_text(&self, url: Url) -> Result<String, SourceError> {
        checked_text(self.get(url).await?).await
    }

    /// Follow `next` links until the listing is exhausted.
    async fn get_all<T: DeserializeOwned>(&self, first: Url) -> Result<Vec<T>, SourceError> {
        let mut values = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next {
            let page: Page<T> = self.get_json(url).await?;
            values.extend(page.values);
            next = page
                .next
                .map(|link| {
                    Url::parse(&link).map_err(|e| SourceError::InvalidUrl(format!("{link}: {e}")))
                })
                .transpose()?;
        }
        Ok(values)
    }

    async fn pull_request(&self, repo: &Repository, id: u64) -> Result<PullRequest, SourceError> {
        let id = id.to_string();
        self.get_json(self.repo_url(repo, ["pullrequests", id.as_str()])?)
            .await
    }
}

#[async_trait]
impl CatalogSource for BitbucketProvider {
    #[instrument(skip(self))]
    async fn workspaces(&self) -> Result<Vec<String>, SourceError> {
        let mut url = self.url(["workspaces"])?;
        url.query_pairs_mut().append_pair("sort", "-updated_on");
        let workspaces: Vec<Slugged> = self.get_all(url).await?;
        Ok(workspaces.into_iter().map(|w| w.slug).collect())
    }

    #[instrument(skip(self))]
    async fn repositories(&self, workspace: &str) -> Result<Vec<Repository>, SourceError> {
        let repos: Vec<Slugged> = self.get_all(self.url(["repositories", workspace])?).await?;
        debug!(count = repos.len(), "listed repositories");
        Ok(repos
            .into_iter()
            .map(|r| Repository::new(workspace, r.slug))
            .collect())
    }

    #[instrument(skip(self, repo), fields(repo = %repo.full_name()))]
    async fn changes(&self, repo: &Repository) -> Result<Vec<Change>, SourceError> {
        let mut url = self.repo_url(repo, ["pullrequests"])?;
        url.query_pairs_mut()
            .append_pair("state", "MERGED")
            .append_pair("sort", "-updated_on");
        let prs: Vec<PullRequest> = self.get_all(url).await?;
        Ok(prs
            .into_iter()
            .map(|pr| Change {
                id: pr.id,
                author: pr
                    .author
                    .map(|a| a.display_name)
                    .unwrap_or_default(),
                state: pr.state,
                base_revision: pr.destination.commit.hash,
                head_revision: pr.source.commit.hash,
            })
            .collect())
    }

    #[instrument(skip(self, repo, change), fields(repo = %repo.full_name(), pr = change.id))]
    async fn changed_files(
        &self,
        repo: &Repository,
        change: &Change,
    ) -> Result<Vec<ChangedFile>, SourceError> {
        let revisions = format!("{}..{}", change.head_revision, change.base_revision);
        let stats: Vec<DiffStat> = self
            .get_all(self.repo_url(repo, ["diffstat", revisions.as_str()])?)
            .await?;
        Ok(stats.into_iter().filter_map(DiffStat::into_changed_file).collect())
    }
}

#[async_trait]
impl DiffSource for BitbucketProvider {
    async fn diff(
        &self,
        repo: &Repository,
        change: &Change,
        file: &ChangedFile,
    ) -> Result<Option<String>, SourceError> {
        let revisions = format!("{}..{}", change.head_revision, change.base_revision);
        let mut url = self.repo_url(repo, ["diff", revisions.as_str()])?;
        url.query_pairs_mut().append_pair("path", file.blame_path());
        let text = self.get_text(url).await?;
        Ok(Some(text).filter(|t| !t.trim().is_empty()))
    }
}

#[async_trait]
impl ReviewerSource for BitbucketProvider {
    #[instrument(skip(self, repo, change), fields(repo = %repo.full_name(), pr = change.id))]
    async fn reviewers(
        &self,
        repo: &Repository,
        change: &Change,
    ) -> Result<HashSet<Identity>, SourceError> {
        let id = change.id.to_string();
        let activities: Vec<Activity> = self
            .get_all(self.repo_url(repo, ["pullrequests", id.as_str(), "activity"])?)
            .await?;
        let mut reviewers: HashSet<Identity> = activity_reviewers(activities).collect();

        // The author of the merge commit merged the change.
        let pr = self.pull_request(repo, change.id).await?;
        if let Some(merge) = pr.merge_commit {
            if let Some(merger) = self.commit_author(repo, &CommitRef::new(merge.hash)).await? {
                reviewers.insert(merger);
            }
        }
        Ok(reviewers)
    }
}

#[async_trait]
impl HistoryBlameSource for BitbucketProvider {
    #[instrument(skip(self, repo), fields(repo = %repo.full_name()))]
    async fn file_history(
        &self,
        repo: &Repository,
        revision: &str,
        path: &str,
    ) -> Result<Vec<CommitRef>, SourceError> {
        let url = self.repo_url(
            repo,
            ["filehistory", revision].into_iter().chain(path.split('/')),
        )?;
        let entries: Vec<FileHistoryEntry> = self.get_all(url).await?;
        Ok(entries
            .into_iter()
            .map(|entry| CommitRef::new(entry.commit.hash))
            .collect())
    }

    async fn commit_diff(
        &self,
        repo: &Repository,
        commit: &CommitRef,
        path: &str,
    ) -> Result<String, SourceError> {
        let mut url = self.repo_url(repo, ["diff", commit.hash.as_str()])?;
        url.query_pairs_mut().append_pair("path", path);
        self.get_text(url).await
    }

    async fn commit_author(
        &self,
        repo: &Repository,
        commit: &CommitRef,
    ) -> Result<Option<Identity>, SourceError> {
        let commit: Commit = self
            .get_json(self.repo_url(repo, ["commit", commit.hash.as_str()])?)
            .await?;
        Ok(commit.author.user.map(|u| u.display_name))
    }
}

impl Provider for BitbucketProvider {
    fn name(&self) -> &str {
        "bitbucket"
    }

    fn blame(&self) -> BlameStrategy<'_> {
        BlameStrategy::Reconstructed(self)
    }
}
