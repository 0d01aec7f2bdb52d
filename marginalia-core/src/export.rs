//! Inline marker stream for the document-transformation toolchain.
//!
//! Split regions are turned into open/close markers keyed by character
//! offset. At a shared offset a close always precedes the next open, so
//! markers never interleave.

use serde::{Deserialize, Serialize};

use crate::split::SplitRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Close,
    Open,
}

/// One inline marker. `region` indexes the split-region slice it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub offset: usize,
    pub kind: MarkerKind,
    pub region: usize,
}

/// Ordered open/close markers for `splits`.
pub fn markers(splits: &[SplitRegion]) -> Vec<Marker> {
    let mut out = Vec::with_capacity(splits.len() * 2);
    for (region, piece) in splits.iter().enumerate() {
        if piece.is_empty() {
            continue;
        }
        out.push(Marker { offset: piece.start, kind: MarkerKind::Open, region });
        out.push(Marker { offset: piece.end, kind: MarkerKind::Close, region });
    }
    out.sort_by_key(|m| (m.offset, m.kind, m.region));
    out
}

/// Render `text` with `{{ids:` ... `}}` around each split region.
///
/// Debug aid for tests and the export CLI; offsets are character indices.
pub fn render_with_markers(text: &str, splits: &[SplitRegion]) -> String {
    let markers = markers(splits);
    let mut out = String::with_capacity(text.len() + markers.len() * 8);
    let mut next = 0;

    for (offset, ch) in text.chars().enumerate() {
        next = push_markers(&mut out, &markers[next..], offset, splits) + next;
        out.push(ch);
    }
    push_markers(&mut out, &markers[next..], usize::MAX, splits);
    out
}

/// Write every marker at or before `offset`; returns how many were written.
fn push_markers(out: &mut String, markers: &[Marker], offset: usize, splits: &[SplitRegion]) -> usize {
    let due = markers.partition_point(|m| m.offset <= offset);
    for marker in &markers[..due] {
        match marker.kind {
            MarkerKind::Open => {
                out.push_str("{{");
                out.push_str(&splits[marker.region].contributors.join(","));
                out.push(':');
            }
            MarkerKind::Close => out.push_str("}}"),
        }
    }
    due
}
