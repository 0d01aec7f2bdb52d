//! Annotation data model.
//!
//! ```text
//! DocumentInfo (external, read-only)
//!   │ char_len, paragraph starts
//!   ▼
//! Highlight ──< Comment          (id-based lookup, no back-pointers)
//!   │
//!   ▼
//! HighlightSpan ──► Region ──► SplitRegion   (ephemeral, never stored)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Stable identifier of a highlight (UUID string, never reused).
pub type HighlightId = String;

/// Name of the tag-order bucket holding highlights without a tag.
pub const UNTAGGED: &str = "__untagged__";

/// Milliseconds since the Unix epoch, used for `created_at` stamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Document
// ───────────────────────────────────────────────────────────────────

/// What the engine needs to know about the annotated document: its length in
/// canonical characters and where paragraphs start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub char_len: usize,
    /// Paragraph start offset → human-facing paragraph number (1-based).
    pub paragraphs: BTreeMap<usize, u32>,
}

impl DocumentInfo {
    /// A document of `char_len` characters with no paragraph mapping.
    pub fn new(char_len: usize) -> Self {
        Self {
            char_len,
            paragraphs: BTreeMap::new(),
        }
    }

    /// Derive length and paragraph starts from the document text.
    ///
    /// Offsets count Unicode scalar values. A paragraph begins at the first
    /// non-whitespace character after the start of text or after a blank line.
    pub fn from_text(text: &str) -> Self {
        let mut paragraphs = BTreeMap::new();
        let mut next_number = 1u32;
        let mut at_block_start = true;
        let mut newlines = 0usize;
        let mut char_len = 0usize;

        for (offset, ch) in text.chars().enumerate() {
            char_len = offset + 1;
            if ch == '\n' {
                newlines += 1;
                if newlines >= 2 {
                    at_block_start = true;
                }
            } else if !ch.is_whitespace() {
                if at_block_start {
                    paragraphs.insert(offset, next_number);
                    next_number += 1;
                    at_block_start = false;
                }
                newlines = 0;
            }
        }

        Self { char_len, paragraphs }
    }

    /// Attach an explicit paragraph mapping.
    pub fn with_paragraphs(mut self, paragraphs: BTreeMap<usize, u32>) -> Self {
        self.paragraphs = paragraphs;
        self
    }

    /// Paragraph number containing `offset`, if the document has a mapping.
    pub fn paragraph_at(&self, offset: usize) -> Option<u32> {
        self.paragraphs
            .range(..=offset)
            .next_back()
            .map(|(_, number)| *number)
    }

    /// Whether `[start, end)` is a valid, non-empty highlight range.
    pub fn contains_range(&self, start: usize, end: usize) -> bool {
        start < end && end <= self.char_len
    }
}

// ───────────────────────────────────────────────────────────────────
// Highlights and comments
// ───────────────────────────────────────────────────────────────────

/// A tagged character range. Snapshot of the replicated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub id: HighlightId,
    pub start: usize,
    pub end: usize,
    /// `None` places the highlight in the [`UNTAGGED`] bucket.
    pub tag: Option<String>,
    pub author: String,
    /// The highlighted text as the author saw it.
    pub text: String,
    pub paragraph_ref: Option<String>,
    pub created_at: u64,
}

impl Highlight {
    /// Bucket name used for tag ordering.
    pub fn bucket(&self) -> &str {
        self.tag.as_deref().unwrap_or(UNTAGGED)
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn span(&self) -> HighlightSpan {
        HighlightSpan::from(self)
    }
}

/// Optional data supplied when a highlight is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightMetadata {
    pub text: String,
    /// Overrides the paragraph number derived from [`DocumentInfo`].
    pub paragraph_ref: Option<String>,
}

impl HighlightMetadata {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            paragraph_ref: None,
        }
    }
}

/// A comment in a highlight's thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub highlight_id: HighlightId,
    pub author: String,
    pub text: String,
    pub created_at: u64,
}

// ───────────────────────────────────────────────────────────────────
// Resolver input
// ───────────────────────────────────────────────────────────────────

/// The `(id, start, end)` tuple the region resolver works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HighlightSpan {
    pub id: HighlightId,
    pub start: usize,
    pub end: usize,
}

impl HighlightSpan {
    pub fn new(id: impl Into<HighlightId>, start: usize, end: usize) -> Self {
        Self {
            id: id.into(),
            start,
            end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl From<&Highlight> for HighlightSpan {
    fn from(h: &Highlight) -> Self {
        Self {
            id: h.id.clone(),
            start: h.start,
            end: h.end,
        }
    }
}
