use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::BlameResolver;
use crate::cache::LookupCache;
use crate::diff::{self, DeletedLine};
use crate::source::{with_timeout, CommitRef, HistoryBlameSource, Identity, Repository};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

type AddedLines = Option<Arc<HashSet<String>>>;

/// Attribution by replaying a file's history.
///
/// Walks the supplied commits in order and returns the author of the first
/// commit whose diff added a line with exactly the deleted line's text. Text
/// that recurs across history goes to the first commit that matches.
pub struct ReconstructedBlame<'a> {
    source: &'a dyn HistoryBlameSource,
    cache: &'a LookupCache,
    repo: &'a Repository,
    path: String,
    commits: Vec<CommitRef>,
    min_chars: usize,
    timeout: Duration,
    // Parsed additions per commit; `None` when the diff could not be fetched.
    added: Mutex<HashMap<String, AddedLines>>,
}

impl<'a> ReconstructedBlame<'a> {
    pub fn new(
        source: &'a dyn HistoryBlameSource,
        cache: &'a LookupCache,
        repo: &'a Repository,
        path: &str,
        commits: Vec<CommitRef>,
        min_chars: usize,
    ) -> Self {
        Self {
            source,
            cache,
            repo,
            path: path.to_string(),
            commits,
            min_chars,
            timeout: DEFAULT_FETCH_TIMEOUT,
            added: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn memoized(&self, commit: &CommitRef) -> Option<AddedLines> {
        self.added
            .lock()
            .ok()
            .and_then(|added| added.get(&commit.hash).cloned())
    }

    fn memoize(&self, commit: &CommitRef, lines: AddedLines) {
        if let Ok(mut added) = self.added.lock() {
            added.insert(commit.hash.clone(), lines);
        }
    }

    async fn added_lines(&self, commit: &CommitRef) -> AddedLines {
        if let Some(lines) = self.memoized(commit) {
            return lines;
        }

        let fetched = self
            .cache
            .commit_diff(commit, &self.path, || async {
                with_timeout(
                    self.timeout,
                    self.source.commit_diff(self.repo, commit, &self.path),
                )
                .await
                .map(Arc::<str>::from)
            })
            .await;

        let lines = match fetched {
            Ok(text) => Some(Arc::new(diff::added_lines(&text, self.min_chars))),
            Err(e) => {
                warn!(commit = %commit.hash, path = %self.path, error = %e, "no diff for commit");
                None
            }
        };
        self.memoize(commit, lines.clone());
        lines
    }

    async fn author_of(&self, commit: &CommitRef) -> Option<Identity> {
        let fetched = self
            .cache
            .commit_author(commit, || {
                with_timeout(self.timeout, self.source.commit_author(self.repo, commit))
            })
            .await;

        match fetched {
            Ok(author) => author,
            Err(e) => {
                warn!(commit = %commit.hash, error = %e, "failed to look up commit author");
                None
            }
        }
    }
}

#[async_trait]
impl BlameResolver for ReconstructedBlame<'_> {
    async fn resolve(&self, line: &DeletedLine) -> Option<Identity> {
        for commit in &self.commits {
            let Some(added) = self.added_lines(commit).await else {
                continue;
            };
            if added.contains(&line.text) {
                let author = self.author_of(commit).await;
                if author.is_none() {
                    debug!(commit = %commit.hash, "introducing commit has no linked author");
                }
                return author;
            }
        }
        debug!(path = %self.path, line = %line.text, "no commit in history added this line");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DEFAULT_MIN_LINE_CHARS;
    use crate::source::mock::MockProvider;

    fn deleted(text: &str) -> DeletedLine {
        DeletedLine {
            text: text.to_string(),
            old_line: 1,
        }
    }

    fn history() -> (Repository, MockProvider) {
        let repo = Repository::new("acme", "widgets");
        let provider = MockProvider::with_history(
            &repo,
            "src/lib.rs",
            vec![
                ("c1", "carol", "@@ -0,0 +1,2 @@\n+fn shared() {}\n+let x = carol_line();\n"),
                ("c2", "dave", "@@ -1,0 +2,2 @@\n+fn shared() {}\n+let y = dave_line();\n"),
            ],
        );
        (repo, provider)
    }

    fn commits() -> Vec<CommitRef> {
        vec![CommitRef::new("c1"), CommitRef::new("c2")]
    }

    #[tokio::test]
    async fn test_attributes_introducing_commit() {
        let (repo, provider) = history();
        let cache = LookupCache::new();
        let blame = ReconstructedBlame::new(&provider, &cache, &repo, "src/lib.rs", commits(), DEFAULT_MIN_LINE_CHARS);
        assert_eq!(blame.resolve(&deleted("let y = dave_line();")).await.as_deref(), Some("dave"));
        assert_eq!(blame.resolve(&deleted("let x = carol_line();")).await.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn test_duplicate_text_first_commit_wins() {
        let (repo, provider) = history();
        let cache = LookupCache::new();
        let blame = ReconstructedBlame::new(&provider, &cache, &repo, "src/lib.rs", commits(), DEFAULT_MIN_LINE_CHARS);
        assert_eq!(blame.resolve(&deleted("fn shared() {}")).await.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn test_unmatched_line_is_unattributed() {
        let (repo, provider) = history();
        let cache = LookupCache::new();
        let blame = ReconstructedBlame::new(&provider, &cache, &repo, "src/lib.rs", commits(), DEFAULT_MIN_LINE_CHARS);
        assert_eq!(blame.resolve(&deleted("never written anywhere")).await, None);
    }

    #[tokio::test]
    async fn test_fetches_go_through_cache() {
        let (repo, provider) = history();
        let cache = LookupCache::new();
        let blame = ReconstructedBlame::new(&provider, &cache, &repo, "src/lib.rs", commits(), DEFAULT_MIN_LINE_CHARS);
        for _ in 0..3 {
            blame.resolve(&deleted("let y = dave_line();")).await;
        }
        // A second resolver over the same cache must not refetch either.
        let again = ReconstructedBlame::new(&provider, &cache, &repo, "src/lib.rs", commits(), DEFAULT_MIN_LINE_CHARS);
        again.resolve(&deleted("let y = dave_line();")).await;

        let counts = provider.fetch_counts();
        assert_eq!(counts.commit_diffs, 2);
        assert_eq!(counts.commit_authors, 1);
    }

    #[tokio::test]
    async fn test_missing_commit_diff_is_skipped() {
        let (repo, provider) = history();
        let cache = LookupCache::new();
        let commits = vec![CommitRef::new("unknown"), CommitRef::new("c2")];
        let blame = ReconstructedBlame::new(&provider, &cache, &repo, "src/lib.rs", commits, DEFAULT_MIN_LINE_CHARS);
        assert_eq!(blame.resolve(&deleted("fn shared() {}")).await.as_deref(), Some("dave"));
    }
}
