//! Domain error taxonomy for the annotation engine.
//!
//! Only [`AnnotationError::InvalidRange`] is meant to reach a user. Unknown
//! ids are an expected outcome of concurrent editing and are reported as
//! `false` by the store rather than through this type; the variant exists for
//! callers that want to lift such a result into an error.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotationError {
    /// Highlight bounds are empty, inverted or past the end of the document.
    #[error("invalid range [{start}, {end}) for document of length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },

    /// The targeted highlight or comment no longer exists.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// A split region spans a structural boundary.
    #[error("region [{start}, {end}) crosses boundary at offset {boundary}")]
    BoundaryInvariantViolation {
        start: usize,
        end: usize,
        boundary: usize,
    },
}

impl AnnotationError {
    /// Whether the error should be surfaced to the collaborator who caused it.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, AnnotationError::InvalidRange { .. })
    }
}
