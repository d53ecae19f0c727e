pub mod range;
pub mod reconstructed;

pub use range::RangeBlame;
pub use reconstructed::ReconstructedBlame;

use async_trait::async_trait;

use crate::diff::DeletedLine;
use crate::source::Identity;

/// Attributes a deleted line to whoever last wrote it.
///
/// `None` means the line could not be attributed. That is not an error:
/// callers leave such lines out of every count.
#[async_trait]
pub trait BlameResolver: Send + Sync {
    async fn resolve(&self, line: &DeletedLine) -> Option<Identity>;
}
