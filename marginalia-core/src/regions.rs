//! Overlap resolution: collapse overlapping highlight ranges into a
//! non-overlapping partition.
//!
//! ```text
//! A  ██████████░░░░░            spans       (0,10,A) (5,15,B)
//! B  ░░░░░██████████
//!    ├────┼────┼────┤
//!    0    5    10   15
//!    {A}  {A,B} {B}             regions     simple | stacked | simple
//! ```
//!
//! Interval sweep over start/end events. Events at the same offset are
//! applied as one group (ends ordered before starts), so a highlight that
//! ends exactly where another begins never yields a zero-width region.
//! A region is emitted only when the active contributor set actually
//! changes, which keeps the output maximal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{HighlightId, HighlightSpan};

/// Default contributor count at which a region stops being drawn as
/// individual indicators.
pub const DEFAULT_COLLAPSE_THRESHOLD: usize = 3;

/// Rendering hint derived from a region's contributor count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackClass {
    /// One contributor.
    Simple,
    /// Between two and `collapse_threshold - 1` contributors, drawn nested.
    Stacked,
    /// `collapse_threshold` or more contributors, drawn as one "many" marker.
    Collapsed,
}

impl StackClass {
    /// Classify a contributor count. Thresholds below 2 behave as 2.
    pub fn classify(contributors: usize, collapse_threshold: usize) -> Self {
        let threshold = collapse_threshold.max(2);
        if contributors <= 1 {
            StackClass::Simple
        } else if contributors >= threshold {
            StackClass::Collapsed
        } else {
            StackClass::Stacked
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub collapse_threshold: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            collapse_threshold: DEFAULT_COLLAPSE_THRESHOLD,
        }
    }
}

/// A maximal segment sharing one set of overlapping highlights.
///
/// `contributors` is sorted by highlight id. For [`StackClass::Stacked`]
/// regions the first contributor is drawn outermost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub contributors: Vec<HighlightId>,
    pub stack_class: StackClass,
}

impl Region {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset < self.end
    }

    pub fn has_contributor(&self, id: &str) -> bool {
        self.contributors.binary_search_by(|c| c.as_str().cmp(id)).is_ok()
    }

    /// Outermost indicator when drawn nested.
    pub fn outer(&self) -> Option<&str> {
        self.contributors.first().map(String::as_str)
    }

    /// Innermost indicator when drawn nested.
    pub fn inner(&self) -> Option<&str> {
        self.contributors.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    // Declaration order is the tie-break: ends before starts.
    End,
    Start,
}

/// Pure, reentrant region resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionResolver {
    config: ResolverConfig,
}

impl RegionResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Partition the union of `spans` into non-overlapping regions.
    ///
    /// Empty or inverted spans are ignored. Output is sorted by offset.
    pub fn resolve(&self, spans: &[HighlightSpan]) -> Vec<Region> {
        let mut events: Vec<(usize, EventKind, &str)> = Vec::with_capacity(spans.len() * 2);
        for span in spans {
            if span.is_empty() {
                log::trace!("Dropping empty span {} at {}", span.id, span.start);
                continue;
            }
            events.push((span.start, EventKind::Start, span.id.as_str()));
            events.push((span.end, EventKind::End, span.id.as_str()));
        }
        events.sort_unstable();

        // Multiset: the same id may legitimately appear in more than one span.
        let mut active: BTreeMap<&str, usize> = BTreeMap::new();
        let mut open: Option<(usize, Vec<&str>)> = None;
        let mut regions = Vec::new();

        let mut i = 0;
        while i < events.len() {
            let offset = events[i].0;
            while i < events.len() && events[i].0 == offset {
                let (_, kind, id) = events[i];
                match kind {
                    EventKind::Start => *active.entry(id).or_insert(0) += 1,
                    EventKind::End => {
                        if let Some(count) = active.get_mut(id) {
                            *count -= 1;
                            if *count == 0 {
                                active.remove(id);
                            }
                        }
                    }
                }
                i += 1;
            }

            let current: Vec<&str> = active.keys().copied().collect();
            open = match open.take() {
                Some((start, ids)) if ids == current => Some((start, ids)),
                Some((start, ids)) => {
                    regions.push(self.region(start, offset, &ids));
                    (!current.is_empty()).then_some((offset, current))
                }
                None => (!current.is_empty()).then_some((offset, current)),
            };
        }

        debug_assert!(open.is_none(), "every start event has a matching end");
        regions
    }

    fn region(&self, start: usize, end: usize, ids: &[&str]) -> Region {
        Region {
            start,
            end,
            contributors: ids.iter().map(|id| id.to_string()).collect(),
            stack_class: StackClass::classify(ids.len(), self.config.collapse_threshold),
        }
    }
}

/// Resolve with the default configuration.
pub fn resolve(spans: &[HighlightSpan]) -> Vec<Region> {
    RegionResolver::default().resolve(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: &str, start: usize, end: usize) -> HighlightSpan {
        HighlightSpan::new(id, start, end)
    }

    fn ids(region: &Region) -> Vec<&str> {
        region.contributors.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_empty_input() {
        assert!(resolve(&[]).is_empty());
    }

    #[test]
    fn test_single_highlight() {
        let regions = resolve(&[span("A", 3, 8)]);
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].start, regions[0].end), (3, 8));
        assert_eq!(regions[0].stack_class, StackClass::Simple);
    }

    #[test]
    fn test_two_overlapping_highlights() {
        let regions = resolve(&[span("A", 0, 10), span("B", 5, 15)]);
        assert_eq!(regions.len(), 3);

        assert_eq!((regions[0].start, regions[0].end), (0, 5));
        assert_eq!(ids(&regions[0]), vec!["A"]);
        assert_eq!(regions[0].stack_class, StackClass::Simple);

        assert_eq!((regions[1].start, regions[1].end), (5, 10));
        assert_eq!(ids(&regions[1]), vec!["A", "B"]);
        assert_eq!(regions[1].stack_class, StackClass::Stacked);

        assert_eq!((regions[2].start, regions[2].end), (10, 15));
        assert_eq!(ids(&regions[2]), vec!["B"]);
        assert_eq!(regions[2].stack_class, StackClass::Simple);
    }

    #[test]
    fn test_three_way_overlap_collapses() {
        let regions = resolve(&[span("A", 0, 20), span("B", 5, 25), span("C", 10, 30)]);
        let middle = regions
            .iter()
            .find(|r| r.start == 10)
            .expect("region starting at 10");
        assert_eq!(middle.end, 20);
        assert_eq!(ids(middle), vec!["A", "B", "C"]);
        assert_eq!(middle.stack_class, StackClass::Collapsed);
        assert_eq!(regions.len(), 5);
    }

    #[test]
    fn test_touching_highlights_do_not_overlap() {
        let regions = resolve(&[span("A", 0, 5), span("B", 5, 10)]);
        assert_eq!(regions.len(), 2);
        assert_eq!(ids(&regions[0]), vec!["A"]);
        assert_eq!(ids(&regions[1]), vec!["B"]);
        assert_eq!(regions[0].end, regions[1].start);
    }

    #[test]
    fn test_gap_between_highlights() {
        let regions = resolve(&[span("A", 0, 3), span("B", 6, 9)]);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].end, 3);
        assert_eq!(regions[1].start, 6);
    }

    #[test]
    fn test_identical_ranges_share_region() {
        let regions = resolve(&[span("B", 2, 7), span("A", 2, 7)]);
        assert_eq!(regions.len(), 1);
        assert_eq!(ids(&regions[0]), vec!["A", "B"]);
        assert_eq!(regions[0].outer(), Some("A"));
        assert_eq!(regions[0].inner(), Some("B"));
    }

    #[test]
    fn test_zero_length_dropped() {
        let regions = resolve(&[span("A", 4, 4), span("B", 9, 2)]);
        assert!(regions.is_empty());
    }

    #[test]
    fn test_nested_highlight() {
        let regions = resolve(&[span("outer", 0, 30), span("inner", 10, 20)]);
        assert_eq!(regions.len(), 3);
        assert_eq!(ids(&regions[1]), vec!["inner", "outer"]);
        assert_eq!(regions[0].contributors, regions[2].contributors);
    }

    #[test]
    fn test_same_id_reopened_at_boundary_stays_merged() {
        // A duplicated span for the same id that ends where the next begins
        // must not produce two adjacent regions with the same contributors.
        let regions = resolve(&[span("A", 0, 5), span("A", 5, 10)]);
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].start, regions[0].end), (0, 10));
    }

    #[test]
    fn test_deterministic_across_input_order() {
        let forward = vec![span("A", 0, 10), span("B", 5, 15), span("C", 7, 9)];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(resolve(&forward), resolve(&backward));
    }

    #[test]
    fn test_configurable_threshold() {
        let resolver = RegionResolver::new(ResolverConfig { collapse_threshold: 4 });
        let regions = resolver.resolve(&[span("A", 0, 20), span("B", 5, 25), span("C", 10, 30)]);
        let middle = regions.iter().find(|r| r.start == 10).unwrap();
        assert_eq!(middle.stack_class, StackClass::Stacked);
    }

    #[test]
    fn test_classify() {
        assert_eq!(StackClass::classify(1, 3), StackClass::Simple);
        assert_eq!(StackClass::classify(2, 3), StackClass::Stacked);
        assert_eq!(StackClass::classify(3, 3), StackClass::Collapsed);
        assert_eq!(StackClass::classify(7, 3), StackClass::Collapsed);
        assert_eq!(StackClass::classify(2, 0), StackClass::Collapsed);
    }

    #[test]
    fn test_has_contributor() {
        let regions = resolve(&[span("A", 0, 10), span("B", 5, 15)]);
        assert!(regions[1].has_contributor("A"));
        assert!(regions[1].has_contributor("B"));
        assert!(!regions[0].has_contributor("B"));
    }
}
