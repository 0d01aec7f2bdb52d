//! Boundary-aware splitting of resolved regions.
//!
//! The downstream transformation drops inline markers that straddle block
//! or inline element boundaries. Every region is cut at each boundary that
//! falls strictly inside it; the pieces stay contiguous and inherit the
//! parent's contributors and stack class.
//!
//! ```text
//! region     [5 ─────────────── 15)      {A}
//! boundary              12
//! split      [5 ──────── 12)[12 ─ 15)    {A} {A}
//! ```

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::error::AnnotationError;
use crate::model::HighlightId;
use crate::regions::{Region, StackClass};

/// A piece of a [`Region`] that crosses no structural boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRegion {
    pub start: usize,
    pub end: usize,
    pub contributors: Vec<HighlightId>,
    pub stack_class: StackClass,
    /// Index of the parent region in the input slice.
    pub parent: usize,
}

impl SplitRegion {
    fn piece(region: &Region, parent: usize, start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            contributors: region.contributors.clone(),
            stack_class: region.stack_class,
            parent,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// First boundary strictly inside `(start, end)`, if any.
    fn crossed_boundary(&self, sorted_boundaries: &[usize]) -> Option<usize> {
        let idx = sorted_boundaries.partition_point(|&b| b <= self.start);
        sorted_boundaries
            .get(idx)
            .copied()
            .filter(|&b| b < self.end)
    }
}

fn normalized(boundaries: &[usize]) -> Cow<'_, [usize]> {
    if boundaries.windows(2).all(|w| w[0] < w[1]) {
        return Cow::Borrowed(boundaries);
    }
    log::warn!(
        "Boundary list of {} offsets is unsorted or has duplicates; normalizing",
        boundaries.len()
    );
    let mut owned = boundaries.to_vec();
    owned.sort_unstable();
    owned.dedup();
    Cow::Owned(owned)
}

/// Cut every region at each boundary offset strictly inside it.
///
/// An empty boundary list returns the regions unchanged. Output is ordered
/// by parent, then by offset.
pub fn split(regions: &[Region], boundaries: &[usize]) -> Vec<SplitRegion> {
    let boundaries = normalized(boundaries);
    let mut out = Vec::with_capacity(regions.len());

    for (parent, region) in regions.iter().enumerate() {
        let first = boundaries.partition_point(|&b| b <= region.start);
        let mut cursor = region.start;
        for &boundary in boundaries[first..].iter().take_while(|&&b| b < region.end) {
            out.push(SplitRegion::piece(region, parent, cursor, boundary));
            cursor = boundary;
        }
        out.push(SplitRegion::piece(region, parent, cursor, region.end));
    }

    out
}

/// Check that no split region crosses a boundary.
pub fn validate_split(splits: &[SplitRegion], boundaries: &[usize]) -> Result<(), AnnotationError> {
    let boundaries = normalized(boundaries);
    for piece in splits {
        if let Some(boundary) = piece.crossed_boundary(&boundaries) {
            log::error!(
                "Split region [{}, {}) crosses boundary {}",
                piece.start,
                piece.end,
                boundary
            );
            return Err(AnnotationError::BoundaryInvariantViolation {
                start: piece.start,
                end: piece.end,
                boundary,
            });
        }
    }
    Ok(())
}

/// [`split`] followed by [`validate_split`].
pub fn split_checked(regions: &[Region], boundaries: &[usize]) -> Result<Vec<SplitRegion>, AnnotationError> {
    let splits = split(regions, boundaries);
    validate_split(&splits, boundaries)?;
    Ok(splits)
}
