use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::source::{CommitRef, Identity};

/// Read-through map where each key is fetched at most once successfully,
/// even when several callers miss on it concurrently. Failed fetches are
/// not stored, so a later caller retries.
struct ReadThrough<K, V> {
    slots: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K: Eq + Hash, V: Clone> ReadThrough<K, V> {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_fetch<E, F, Fut>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(key).or_default())
        };
        slot.get_or_try_init(fetch).await.cloned()
    }

    async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

/// Per-repository memo of commit authors and per-commit file diffs.
///
/// Create one when a repository starts and drop it when the repository ends.
pub struct LookupCache {
    authors: ReadThrough<String, Option<Identity>>,
    diffs: ReadThrough<(String, String), Arc<str>>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self {
            authors: ReadThrough::new(),
            diffs: ReadThrough::new(),
        }
    }

    pub async fn commit_author<E, F, Fut>(
        &self,
        commit: &CommitRef,
        fetch: F,
    ) -> Result<Option<Identity>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Identity>, E>>,
    {
        self.authors.get_or_fetch(commit.hash.clone(), fetch).await
    }

    pub async fn commit_diff<E, F, Fut>(
        &self,
        commit: &CommitRef,
        path: &str,
        fetch: F,
    ) -> Result<Arc<str>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<str>, E>>,
    {
        self.diffs
            .get_or_fetch((commit.hash.clone(), path.to_string()), fetch)
            .await
    }

    /// Number of (author, diff) entries currently held.
    pub async fn sizes(&self) -> (usize, usize) {
        (self.authors.len().await, self.diffs.len().await)
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}
