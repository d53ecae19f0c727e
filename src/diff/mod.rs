pub mod types;

pub use types::{DeletedLine, Hunk, HunkLine, DEFAULT_MIN_LINE_CHARS};

use std::collections::HashSet;
use std::str::Lines;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Invalid hunk header: {0}")]
    HunkHeader(String),

    #[error("Invalid range {part} in hunk header")]
    Range { part: String },
}

/// Parsed `@@ -old_start,old_count +new_start,new_count @@` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HunkHeader {
    old_start: usize,
    old_count: usize,
    new_start: usize,
    new_count: usize,
}

/// Classification of a single line inside a hunk body.
enum BodyLine<'a> {
    Context,
    Added(&'a str),
    Removed(&'a str),
    /// `\ No newline at end of file`
    Marker,
}

fn classify(line: &str) -> Option<BodyLine<'_>> {
    if let Some(rest) = line.strip_prefix('-') {
        Some(BodyLine::Removed(rest))
    } else if let Some(rest) = line.strip_prefix('+') {
        Some(BodyLine::Added(rest))
    } else if line.starts_with(' ') || line.is_empty() {
        // Some tools strip the single space from blank context lines.
        Some(BodyLine::Context)
    } else if line.starts_with('\\') {
        Some(BodyLine::Marker)
    } else {
        None
    }
}

fn significant(text: &str, min_chars: usize) -> Option<&str> {
    let trimmed = text.trim();
    (trimmed.chars().count() >= min_chars).then_some(trimmed)
}

/// Lazily yields the significant removed lines of a unified diff.
///
/// For every hunk exactly `old_count` old-side lines (context + removed) are
/// consumed, so file headers and trailing text are never mistaken for
/// deletions. Malformed hunk headers are logged and their bodies skipped.
/// The iterator is `Clone`, so a sequence can be restarted from any point.
#[derive(Debug, Clone)]
pub struct DeletedLines<'a> {
    lines: Lines<'a>,
    min_chars: usize,
    remaining_old: usize,
    old_line: usize,
}

impl<'a> DeletedLines<'a> {
    fn enter_hunk(&mut self, header_line: &str) {
        match parse_hunk_header(header_line) {
            Ok(header) => {
                self.remaining_old = header.old_count;
                self.old_line = header.old_start;
            }
            Err(e) => {
                debug!(error = %e, "skipping malformed hunk");
                self.remaining_old = 0;
            }
        }
    }
}

impl<'a> Iterator for DeletedLines<'a> {
    type Item = DeletedLine;

    fn next(&mut self) -> Option<DeletedLine> {
        while let Some(line) = self.lines.next() {
            if self.remaining_old == 0 {
                if line.starts_with("@@") {
                    self.enter_hunk(line);
                }
                continue;
            }

            match classify(line) {
                Some(BodyLine::Removed(text)) => {
                    let old_line = self.old_line;
                    self.old_line = self.old_line.saturating_add(1);
                    self.remaining_old -= 1;
                    if let Some(text) = significant(text, self.min_chars) {
                        return Some(DeletedLine {
                            text: text.to_string(),
                            old_line,
                        });
                    }
                }
                Some(BodyLine::Context) => {
                    self.old_line = self.old_line.saturating_add(1);
                    self.remaining_old -= 1;
                }
                Some(BodyLine::Added(_)) | Some(BodyLine::Marker) => {}
                None if line.starts_with("@@") => self.enter_hunk(line),
                None => {
                    debug!(line, "hunk body ended before its old count was consumed");
                    self.remaining_old = 0;
                }
            }
        }
        None
    }
}

/// Significant deleted lines of `diff`, in diff order.
pub fn deleted_lines(diff: &str, min_chars: usize) -> DeletedLines<'_> {
    DeletedLines {
        lines: diff.lines(),
        min_chars,
        remaining_old: 0,
        old_line: 0,
    }
}

/// Parse every well-formed hunk of a unified diff.
///
/// A hunk body ends once both its old and new counts are consumed. Hunks whose
/// header does not parse are skipped along with their body.
pub fn parse_hunks(diff: &str) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut current: Option<(Hunk, usize, usize)> = None;

    for line in diff.lines() {
        if let Some((hunk, remaining_old, remaining_new)) = current.as_mut() {
            if *remaining_old > 0 || *remaining_new > 0 {
                match classify(line) {
                    Some(BodyLine::Context) => {
                        hunk.lines
                            .push(HunkLine::Context(line.get(1..).unwrap_or("").to_string()));
                        *remaining_old = remaining_old.saturating_sub(1);
                        *remaining_new = remaining_new.saturating_sub(1);
                        continue;
                    }
                    Some(BodyLine::Removed(text)) => {
                        hunk.lines.push(HunkLine::Removed(text.to_string()));
                        *remaining_old = remaining_old.saturating_sub(1);
                        continue;
                    }
                    Some(BodyLine::Added(text)) => {
                        hunk.lines.push(HunkLine::Added(text.to_string()));
                        *remaining_new = remaining_new.saturating_sub(1);
                        continue;
                    }
                    Some(BodyLine::Marker) => continue,
                    None => {}
                }
            }
        }

        if line.starts_with("@@") {
            if let Some((hunk, _, _)) = current.take() {
                push_hunk(&mut hunks, hunk);
            }
            match parse_hunk_header(line) {
                Ok(header) => {
                    current = Some((
                        Hunk {
                            old_start: header.old_start,
                            old_count: header.old_count,
                            new_start: header.new_start,
                            new_count: header.new_count,
                            lines: Vec::new(),
                        },
                        header.old_count,
                        header.new_count,
                    ));
                }
                Err(e) => debug!(error = %e, "skipping malformed hunk"),
            }
        }
    }

    if let Some((hunk, _, _)) = current {
        push_hunk(&mut hunks, hunk);
    }
    hunks
}

fn push_hunk(hunks: &mut Vec<Hunk>, hunk: Hunk) {
    if hunk.consumed_old() != hunk.old_count {
        debug!(
            old_start = hunk.old_start,
            expected = hunk.old_count,
            consumed = hunk.consumed_old(),
            "truncated hunk"
        );
    }
    hunks.push(hunk);
}

/// Trimmed, significant lines added by `diff`.
pub fn added_lines(diff: &str, min_chars: usize) -> HashSet<String> {
    parse_hunks(diff)
        .into_iter()
        .flat_map(|hunk| hunk.lines)
        .filter_map(|line| match line {
            HunkLine::Added(text) => significant(&text, min_chars).map(str::to_string),
            _ => None,
        })
        .collect()
}

fn parse_hunk_header(line: &str) -> Result<HunkHeader, DiffError> {
    let ranges = line
        .trim()
        .strip_prefix("@@")
        .and_then(|rest| rest.split_once("@@"))
        .map(|(ranges, _section)| ranges.trim())
        .ok_or_else(|| DiffError::HunkHeader(line.to_string()))?;
    let mut parts = ranges.split_whitespace();
    let old_part = parts
        .next()
        .ok_or_else(|| DiffError::HunkHeader(line.to_string()))?;
    let new_part = parts
        .next()
        .ok_or_else(|| DiffError::HunkHeader(line.to_string()))?;

    let (old_start, old_count) = parse_range(old_part, '-')?;
    let (new_start, new_count) = parse_range(new_part, '+')?;

    Ok(HunkHeader {
        old_start,
        old_count,
        new_start,
        new_count,
    })
}

fn parse_range(part: &str, prefix: char) -> Result<(usize, usize), DiffError> {
    let invalid = || DiffError::Range {
        part: part.to_string(),
    };
    let range = part.strip_prefix(prefix).ok_or_else(invalid)?;
    let (start_str, count_str) = match range.split_once(',') {
        Some((start, count)) => (start, count),
        None => (range, "1"),
    };
    let start = start_str.parse::<usize>().map_err(|_| invalid())?;
    let count = count_str.parse::<usize>().map_err(|_| invalid())?;
    // The range must end within line numbers we can represent.
    start.checked_add(count).ok_or_else(invalid)?;
    Ok((start, count))
}
