//! GitHub adapter: GraphQL for listings, reviews and blame; REST for the
//! per-file patches of a pull request.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{
    checked_json, BlameRange, BlameStrategy, CatalogSource, Change, ChangeState, ChangedFile,
    DiffSource, Identity, Provider, RangeBlameSource, Repository, ReviewerSource, SourceError,
};
use crate::config::Config;

const USER_AGENT: &str = "review-coverage";
const FILES_PER_PAGE: usize = 100;
// GitHub stops listing pull request files after 3000 entries.
const MAX_FILE_PAGES: usize = 30;

const ORGANIZATIONS_QUERY: &str = r#"
query($cursor: String) {
  viewer {
    organizations(first: 100, after: $cursor) {
      nodes { login }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

const REPOSITORIES_QUERY: &str = r#"
query($owner: String!, $cursor: String) {
  organization(login: $owner) {
    repositories(first: 100, after: $cursor) {
      nodes { name }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

const PULL_REQUESTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: 100, after: $cursor, states: [MERGED]) {
      nodes {
        number
        state
        author { login }
        baseRefOid
        headRefOid
      }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

const REVIEWERS_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      mergedBy { login }
      reviews(first: 100) {
        nodes { author { login } }
      }
    }
  }
}"#;

const BLAME_QUERY: &str = r#"
query($owner: String!, $name: String!, $oid: GitObjectID!, $path: String!) {
  repository(owner: $owner, name: $name) {
    object(oid: $oid) {
      ... on Commit {
        blame(path: $path) {
          ranges {
            startingLine
            endingLine
            commit { author { user { login } } }
          }
        }
      }
    }
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    nodes: Vec<T>,
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

impl PageInfo {
    fn next_cursor(&self) -> Option<String> {
        if self.has_next_page {
            self.end_cursor.clone()
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct Actor {
    login: String,
}

#[derive(Debug, Deserialize)]
struct OrganizationsData {
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    organizations: Connection<Actor>,
}

#[derive(Debug, Deserialize)]
struct RepositoriesData {
    organization: Option<OrganizationRepos>,
}

#[derive(Debug, Deserialize)]
struct OrganizationRepos {
    repositories: Connection<RepoNode>,
}

#[derive(Debug, Deserialize)]
struct RepoNode {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestsData {
    repository: Option<RepoPullRequests>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoPullRequests {
    pull_requests: Connection<PullRequestNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestNode {
    number: u64,
    state: String,
    author: Option<Actor>,
    base_ref_oid: String,
    head_ref_oid: String,
}

#[derive(Debug, Deserialize)]
struct ReviewersData {
    repository: Option<RepoPullRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoPullRequest {
    pull_request: Option<ReviewedPullRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewedPullRequest {
    merged_by: Option<Actor>,
    reviews: ReviewNodes,
}

#[derive(Debug, Deserialize)]
struct ReviewNodes {
    nodes: Vec<ReviewNode>,
}

#[derive(Debug, Deserialize)]
struct ReviewNode {
    author: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct BlameData {
    repository: Option<BlameRepository>,
}

#[derive(Debug, Deserialize)]
struct BlameRepository {
    object: Option<BlameObject>,
}

#[derive(Debug, Deserialize)]
struct BlameObject {
    blame: Option<Blame>,
}

#[derive(Debug, Deserialize)]
struct Blame {
    ranges: Vec<BlameRangeNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlameRangeNode {
    starting_line: usize,
    ending_line: usize,
    commit: BlameCommit,
}

#[derive(Debug, Deserialize)]
struct BlameCommit {
    author: Option<GitActor>,
}

#[derive(Debug, Deserialize)]
struct GitActor {
    user: Option<Actor>,
}

/// One entry of `GET /repos/{owner}/{repo}/pulls/{number}/files`.
#[derive(Debug, Deserialize)]
struct PullFile {
    filename: String,
    status: String,
    deletions: usize,
    #[serde(default)]
    patch: Option<String>,
    #[serde(default)]
    previous_filename: Option<String>,
}

impl From<PullFile> for ChangedFile {
    fn from(file: PullFile) -> Self {
        let old_path = match file.status.as_str() {
            "added" => None,
            "renamed" => file.previous_filename.or_else(|| Some(file.filename.clone())),
            _ => Some(file.filename.clone()),
        };
        ChangedFile {
            path: file.filename,
            old_path,
            deletions: file.deletions,
            patch: file.patch,
        }
    }
}

fn change_state(state: &str) -> ChangeState {
    match state {
        "MERGED" => ChangeState::Merged,
        "OPEN" => ChangeState::Open,
        _ => ChangeState::Declined,
    }
}

impl From<BlameRangeNode> for BlameRange {
    fn from(node: BlameRangeNode) -> Self {
        BlameRange {
            start_line: node.starting_line,
            end_line: node.ending_line,
            author: node
                .commit
                .author
                .and_then(|a| a.user)
                .map(|user| user.login),
        }
    }
}

/// GraphQL endpoint for a REST API root. GitHub Enterprise serves REST under
/// `/api/v3` and GraphQL under `/api/graphql`.
fn graphql_url(api_url: &str) -> String {
    let api_url = api_url.trim_end_matches('/');
    match api_url.strip_suffix("/v3") {
        Some(root) => format!("{root}/graphql"),
        None => format!("{api_url}/graphql"),
    }
}

pub struct GitHubProvider {
    client: reqwest::Client,
    token: String,
    api_url: String,
    graphql_url: String,
}

impl GitHubProvider {
    pub fn new(config: &Config) -> Result<Self, SourceError> {
        let token = config
            .github
            .token
            .clone()
            .ok_or(SourceError::MissingCredentials(
                "GitHub token (set GITHUB_TOKEN or [github] token)",
            ))?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.coverage.request_timeout())
            .build()?;
        let api_url = config.github_api_url().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            token,
            graphql_url: graphql_url(&api_url),
            api_url,
        })
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, SourceError> {
        let response = self
            .client
            .post(&self.graphql_url)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let body: GraphQlResponse<T> = checked_json(response).await?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(SourceError::Decode(messages.join("; ")));
        }
        body.data
            .ok_or_else(|| SourceError::Decode("GraphQL response without data".to_string()))
    }

    async fn pull_files_page(
        &self,
        repo: &Repository,
        number: u64,
        page: usize,
    ) -> Result<Vec<PullFile>, SourceError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/files",
            self.api_url, repo.workspace, repo.slug, number
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .query(&[("per_page", FILES_PER_PAGE), ("page", page)])
            .send()
            .await?;
        checked_json(response).await
    }
}

#[async_trait]
impl CatalogSource for GitHubProvider {
    #[instrument(skip(self))]
    async fn workspaces(&self) -> Result<Vec<String>, SourceError> {
        let mut logins = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data: OrganizationsData = self
                .graphql(ORGANIZATIONS_QUERY, json!({ "cursor": cursor }))
                .await?;
            let page = data.viewer.organizations;
            logins.extend(page.nodes.into_iter().map(|org| org.login));
            match page.page_info.next_cursor() {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(count = logins.len(), "listed organizations");
        Ok(logins)
    }

    #[instrument(skip(self))]
    async fn repositories(&self, workspace: &str) -> Result<Vec<Repository>, SourceError> {
        let mut repos = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data: RepositoriesData = self
                .graphql(
                    REPOSITORIES_QUERY,
                    json!({ "owner": workspace, "cursor": cursor }),
                )
                .await?;
            let page = data
                .organization
                .ok_or_else(|| SourceError::NotFound(format!("organization {workspace}")))?
                .repositories;
            repos.extend(
                page.nodes
                    .into_iter()
                    .map(|node| Repository::new(workspace, node.name)),
            );
            match page.page_info.next_cursor() {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(repos)
    }

    #[instrument(skip(self, repo), fields(repo = %repo.full_name()))]
    async fn changes(&self, repo: &Repository) -> Result<Vec<Change>, SourceError> {
        let mut changes = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data: PullRequestsData = self
                .graphql(
                    PULL_REQUESTS_QUERY,
                    json!({ "owner": repo.workspace, "name": repo.slug, "cursor": cursor }),
                )
                .await?;
            let page = data
                .repository
                .ok_or_else(|| SourceError::NotFound(format!("repository {}", repo.full_name())))?
                .pull_requests;
            changes.extend(page.nodes.into_iter().map(|pr| Change {
                id: pr.number,
                // Deleted accounts come back as null authors.
                author: pr.author.map(|a| a.login).unwrap_or_else(|| "ghost".to_string()),
                state: change_state(&pr.state),
                base_revision: pr.base_ref_oid,
                head_revision: pr.head_ref_oid,
            }));
            match page.page_info.next_cursor() {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(changes)
    }

    #[instrument(skip(self, repo, change), fields(repo = %repo.full_name(), pr = change.id))]
    async fn changed_files(
        &self,
        repo: &Repository,
        change: &Change,
    ) -> Result<Vec<ChangedFile>, SourceError> {
        let mut files = Vec::new();
        for page in 1..=MAX_FILE_PAGES {
            let batch = self.pull_files_page(repo, change.id, page).await?;
            let last = batch.len() < FILES_PER_PAGE;
            files.extend(batch.into_iter().map(ChangedFile::from));
            if last {
                break;
            }
        }
        debug!(files = files.len(), "listed pull request files");
        Ok(files)
    }
}

#[async_trait]
impl DiffSource for GitHubProvider {
    /// The REST file listing already carries each file's patch.
    async fn diff(
        &self,
        _repo: &Repository,
        _change: &Change,
        file: &ChangedFile,
    ) -> Result<Option<String>, SourceError> {
        Ok(file.patch.clone())
    }
}

#[async_trait]
impl ReviewerSource for GitHubProvider {
    #[instrument(skip(self, repo, change), fields(repo = %repo.full_name(), pr = change.id))]
    async fn reviewers(
        &self,
        repo: &Repository,
        change: &Change,
    ) -> Result<HashSet<Identity>, SourceError> {
        let data: ReviewersData = self
            .graphql(
                REVIEWERS_QUERY,
                json!({ "owner": repo.workspace, "name": repo.slug, "number": change.id }),
            )
            .await?;
        let pr = data
            .repository
            .and_then(|r| r.pull_request)
            .ok_or_else(|| SourceError::NotFound(format!("pull request {}", change.id)))?;

        let mut reviewers: HashSet<Identity> = pr
            .reviews
            .nodes
            .into_iter()
            .filter_map(|review| review.author.map(|a| a.login))
            .collect();
        if let Some(merger) = pr.merged_by {
            reviewers.insert(merger.login);
        }
        Ok(reviewers)
    }
}

#[async_trait]
impl RangeBlameSource for GitHubProvider {
    #[instrument(skip(self, repo), fields(repo = %repo.full_name()))]
    async fn range_blame(
        &self,
        repo: &Repository,
        revision: &str,
        path: &str,
    ) -> Result<Vec<BlameRange>, SourceError> {
        let data: BlameData = self
            .graphql(
                BLAME_QUERY,
                json!({ "owner": repo.workspace, "name": repo.slug, "oid": revision, "path": path }),
            )
            .await?;
        let ranges = data
            .repository
            .and_then(|r| r.object)
            .and_then(|o| o.blame)
            .map(|b| b.ranges)
            .unwrap_or_default();
        Ok(ranges.into_iter().map(BlameRange::from).collect())
    }
}

impl Provider for GitHubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn blame(&self) -> BlameStrategy<'_> {
        BlameStrategy::Range(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graphql_url() {
        assert_eq!(graphql_url("https://api.github.com"), "https://api.github.com/graphql");
        assert_eq!(
            graphql_url("https://github.example.com/api/v3/"),
            "https://github.example.com/api/graphql"
        );
    }

    #[test]
    fn test_pull_file_statuses() {
        let files: Vec<PullFile> = serde_json::from_str(
            r#"[
                {"filename": "new.rs", "status": "added", "deletions": 0, "patch": "@@ -0,0 +1 @@\n+x"},
                {"filename": "moved.rs", "status": "renamed", "deletions": 2, "previous_filename": "old.rs"},
                {"filename": "image.png", "status": "modified", "deletions": 0}
            ]"#,
        )
        .unwrap();
        let files: Vec<ChangedFile> = files.into_iter().map(ChangedFile::from).collect();

        assert_eq!(files[0].old_path, None);
        assert_eq!(files[1].blame_path(), "old.rs");
        assert_eq!(files[2].old_path.as_deref(), Some("image.png"));
        assert!(files[2].patch.is_none());
    }

    #[test]
    fn test_blame_ranges_keep_unlinked_authors_as_none() {
        let data: GraphQlResponse<BlameData> = serde_json::from_str(
            r#"{"data": {"repository": {"object": {"blame": {"ranges": [
                {"startingLine": 1, "endingLine": 4, "commit": {"author": {"user": {"login": "carol"}}}},
                {"startingLine": 5, "endingLine": 5, "commit": {"author": {"user": null}}}
            ]}}}}}"#,
        )
        .unwrap();
        let ranges: Vec<BlameRange> = data
            .data
            .and_then(|d| d.repository)
            .and_then(|r| r.object)
            .and_then(|o| o.blame)
            .map(|b| b.ranges.into_iter().map(BlameRange::from).collect())
            .unwrap();

        assert_eq!(ranges[0].author.as_deref(), Some("carol"));
        assert_eq!((ranges[0].start_line, ranges[0].end_line), (1, 4));
        assert_eq!(ranges[1].author, None);
    }

    #[test]
    fn test_graphql_errors_deserialize() {
        let body: GraphQlResponse<OrganizationsData> = serde_json::from_str(
            r#"{"data": null, "errors": [{"message": "Bad credentials"}]}"#,
        )
        .unwrap();
        assert!(body.data.is_none());
        assert_eq!(body.errors[0].message, "Bad credentials");
    }

    #[test]
    fn test_change_state_mapping() {
        assert_eq!(change_state("MERGED"), ChangeState::Merged);
        assert_eq!(change_state("OPEN"), ChangeState::Open);
        assert_eq!(change_state("CLOSED"), ChangeState::Declined);
    }

    #[test]
    fn test_new_requires_token() {
        let config = Config::default();
        assert!(matches!(
            GitHubProvider::new(&config),
            Err(SourceError::MissingCredentials(_))
        ));
    }
}
