use async_trait::async_trait;

use super::BlameResolver;
use crate::diff::DeletedLine;
use crate::source::{BlameRange, Identity};

/// Attribution from precomputed author-tagged line ranges.
///
/// Ranges are expected not to overlap. When they do, the earliest range the
/// feed returned wins. Ranges without an author never match.
pub struct RangeBlame {
    ranges: Vec<BlameRange>,
}

impl RangeBlame {
    pub fn new(ranges: Vec<BlameRange>) -> Self {
        Self { ranges }
    }

    fn author_of(&self, line_number: usize) -> Option<&Identity> {
        self.ranges
            .iter()
            .filter(|range| range.contains(line_number))
            .find_map(|range| range.author.as_ref())
    }
}

#[async_trait]
impl BlameResolver for RangeBlame {
    async fn resolve(&self, line: &DeletedLine) -> Option<Identity> {
        self.author_of(line.old_line).cloned()
    }
}
