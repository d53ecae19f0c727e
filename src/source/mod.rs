pub mod bitbucket;
pub mod github;
pub mod mock;
pub mod types;

pub use types::{BlameRange, Change, ChangeState, ChangedFile, CommitRef, Identity, Repository};

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("API request failed: {0}")]
    ApiRequest(#[from] reqwest::Error),

    #[error("API returned {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected API response: {0}")]
    Decode(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Enumerates what to score. Pagination stays inside the adapter.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn workspaces(&self) -> Result<Vec<String>, SourceError>;

    async fn repositories(&self, workspace: &str) -> Result<Vec<Repository>, SourceError>;

    /// Changes of a repository; adapters may pre-filter to merged ones.
    async fn changes(&self, repo: &Repository) -> Result<Vec<Change>, SourceError>;

    async fn changed_files(
        &self,
        repo: &Repository,
        change: &Change,
    ) -> Result<Vec<ChangedFile>, SourceError>;
}

#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Unified diff of one file between the change's base and head;
    /// `Ok(None)` when the provider has no text patch for it (binary files).
    async fn diff(
        &self,
        repo: &Repository,
        change: &Change,
        file: &ChangedFile,
    ) -> Result<Option<String>, SourceError>;
}

#[async_trait]
pub trait ReviewerSource: Send + Sync {
    /// Everyone who reviewed the change, including whoever merged it.
    async fn reviewers(
        &self,
        repo: &Repository,
        change: &Change,
    ) -> Result<HashSet<Identity>, SourceError>;
}

#[async_trait]
pub trait RangeBlameSource: Send + Sync {
    async fn range_blame(
        &self,
        repo: &Repository,
        revision: &str,
        path: &str,
    ) -> Result<Vec<BlameRange>, SourceError>;
}

#[async_trait]
pub trait HistoryBlameSource: Send + Sync {
    /// Commits touching `path` up to `revision`, in the provider's order.
    async fn file_history(
        &self,
        repo: &Repository,
        revision: &str,
        path: &str,
    ) -> Result<Vec<CommitRef>, SourceError>;

    async fn commit_diff(
        &self,
        repo: &Repository,
        commit: &CommitRef,
        path: &str,
    ) -> Result<String, SourceError>;

    /// `Ok(None)` when the commit author has no linked account.
    async fn commit_author(
        &self,
        repo: &Repository,
        commit: &CommitRef,
    ) -> Result<Option<Identity>, SourceError>;
}

/// How a provider attributes deleted lines.
#[derive(Clone, Copy)]
pub enum BlameStrategy<'a> {
    Range(&'a dyn RangeBlameSource),
    Reconstructed(&'a dyn HistoryBlameSource),
}

/// A hosting provider: every feed the engine consumes.
pub trait Provider: CatalogSource + DiffSource + ReviewerSource {
    fn name(&self) -> &str;

    fn blame(&self) -> BlameStrategy<'_>;
}

/// Bound a fetch by `limit`, reporting expiry as [`SourceError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fetch: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    tokio::time::timeout(limit, fetch)
        .await
        .map_err(|_| SourceError::Timeout(limit))?
}

/// Read a response body, turning non-success statuses into [`SourceError::Status`].
pub(crate) async fn checked_text(response: reqwest::Response) -> Result<String, SourceError> {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(SourceError::Status {
            status: status.as_u16(),
            url,
            body,
        });
    }
    Ok(body)
}

/// Like [`checked_text`], then decode JSON.
pub(crate) async fn checked_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SourceError> {
    let body = checked_text(response).await?;
    serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_message() {
        let err = SourceError::Status {
            status: 404,
            url: "https://api.example.com/x".to_string(),
            body: "not found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("404"));
        assert!(msg.contains("https://api.example.com/x"));
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<(), SourceError> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SourceError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, SourceError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
