/// Minimum trimmed length for a line to be attributed. Shorter lines (braces,
/// `else`, blank separators) recur everywhere and cannot be blamed reliably.
pub const DEFAULT_MIN_LINE_CHARS: usize = 4;

/// A contiguous region of changes within a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// Starting line number in the old file
    pub old_start: usize,
    /// Number of lines in the old file
    pub old_count: usize,
    /// Starting line number in the new file
    pub new_start: usize,
    /// Number of lines in the new file
    pub new_count: usize,
    /// Body lines, marker stripped and tagged
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Number of old-file lines the body consumed (context + removed).
    pub fn consumed_old(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Context(_) | HunkLine::Removed(_)))
            .count()
    }
}

/// One body line of a hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Added(String),
    Removed(String),
}

/// A line present in the old revision and removed by the change.
///
/// Carries both the trimmed text and the 1-based line number in the old file,
/// so either blame strategy can consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedLine {
    /// Line content with the `-` marker and surrounding whitespace removed
    pub text: String,
    /// 1-based line number in the old revision
    pub old_line: usize,
}
