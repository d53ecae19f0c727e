use serde::Deserialize;

/// A person as the hosting provider names them (login or display name).
pub type Identity = String;

/// A repository inside a workspace (GitHub organization, Bitbucket workspace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub workspace: String,
    pub slug: String,
}

impl Repository {
    pub fn new(workspace: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            slug: slug.into(),
        }
    }

    /// `workspace/slug`, used in skip entries and log fields.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.workspace, self.slug)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeState {
    Open,
    Merged,
    Declined,
}

/// A pull request as listed by the provider.
#[derive(Debug, Clone)]
pub struct Change {
    /// PR number or id
    pub id: u64,
    pub author: Identity,
    pub state: ChangeState,
    /// Revision the deleted lines are blamed against
    pub base_revision: String,
    /// Revision the change was made on
    pub head_revision: String,
}

/// One file touched by a change.
#[derive(Debug, Clone)]
pub struct ChangedFile {
    /// Path in the new revision
    pub path: String,
    /// Path in the base revision; `None` when the file was created by the change
    pub old_path: Option<String>,
    /// Removed-line count as reported by the provider
    pub deletions: usize,
    /// Inline patch text, when the provider ships it with the file listing
    pub patch: Option<String>,
}

impl ChangedFile {
    /// Path to blame against: the base-revision path.
    pub fn blame_path(&self) -> &str {
        self.old_path.as_deref().unwrap_or(&self.path)
    }
}

/// An author-tagged inclusive range of base-revision line numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameRange {
    pub start_line: usize,
    pub end_line: usize,
    /// `None` when the commit has no linked user account
    pub author: Option<Identity>,
}

impl BlameRange {
    pub fn contains(&self, line: usize) -> bool {
        self.start_line <= line && line <= self.end_line
    }
}

/// A commit in a file's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitRef {
    pub hash: String,
}

impl CommitRef {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
}
