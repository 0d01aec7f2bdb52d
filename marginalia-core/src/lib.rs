//! # marginalia-core: Annotation model and region resolution
//!
//! Pure, reentrant building blocks of the annotation engine. Nothing in this
//! crate performs I/O or touches the replicated store; callers hand in a
//! snapshot of highlights and get disposable render data back.
//!
//! ## Pipeline
//!
//! ```text
//! Highlight[] ──► HighlightSpan[] ──► RegionResolver ──► Region[]
//!                                                          │
//!                        structural boundaries ──► split ──┘
//!                                                          ▼
//!                                   SplitRegion[] ──► markers ──► toolchain
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Highlights, comments, document info
//! - [`error`]: Domain error taxonomy
//! - [`regions`]: Overlap resolution and stack classification
//! - [`split`]: Boundary-aware splitting
//! - [`export`]: Inline marker stream

pub mod error;
pub mod export;
pub mod model;
pub mod regions;
pub mod split;

pub use error::AnnotationError;
pub use export::{markers, render_with_markers, Marker, MarkerKind};
pub use model::{
    now_millis, Comment, DocumentInfo, Highlight, HighlightId, HighlightMetadata, HighlightSpan,
    UNTAGGED,
};
pub use regions::{resolve, Region, RegionResolver, ResolverConfig, StackClass, DEFAULT_COLLAPSE_THRESHOLD};
pub use split::{split, split_checked, validate_split, SplitRegion};
