//! Inclusive sequence-number ranges used by selective acknowledgments.
//!
//! A [`RangeList`] is always sorted, non-overlapping, and non-adjacent, and
//! never holds more than [`MAX_RANGES`] entries. Lists arriving from the peer
//! are checked with [`RangeList::is_well_formed`] before use.

use serde::{Deserialize, Serialize};

use crate::message::SeqNum;

/// Maximum number of ranges carried by a single list.
pub const MAX_RANGES: usize = 255;

/// Inclusive range of sequence numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    start: SeqNum,
    end: SeqNum,
}

impl Range {
    /// Create a range, returning `None` when `start > end`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tunnelframe::{Range, SeqNum};
    /// let range = Range::new(SeqNum::new(3), SeqNum::new(5)).expect("ordered bounds");
    /// assert!(range.contains(SeqNum::new(4)));
    /// assert!(Range::new(SeqNum::new(5), SeqNum::new(3)).is_none());
    /// ```
    #[must_use]
    pub fn new(start: SeqNum, end: SeqNum) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// A range covering exactly one sequence number.
    #[must_use]
    pub const fn single(seq: SeqNum) -> Self { Self { start: seq, end: seq } }

    /// First sequence number in the range.
    #[must_use]
    pub const fn start(&self) -> SeqNum { self.start }

    /// Last sequence number in the range.
    #[must_use]
    pub const fn end(&self) -> SeqNum { self.end }

    /// Whether `seq` falls inside the range.
    #[must_use]
    pub fn contains(&self, seq: SeqNum) -> bool { self.start <= seq && seq <= self.end }

    fn touches(&self, next: &Self) -> bool {
        next.start.get() <= self.end.get().saturating_add(1)
    }
}

/// Ordered set of disjoint inclusive ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeList(Vec<Range>);

impl RangeList {
    /// An empty list.
    #[must_use]
    pub const fn new() -> Self { Self(Vec::new()) }

    /// Build a list from arbitrary ranges, sorting and merging overlapping or
    /// adjacent entries. Ranges beyond [`MAX_RANGES`] are dropped from the
    /// high end.
    #[must_use]
    pub fn from_ranges(ranges: impl IntoIterator<Item = Range>) -> Self {
        let mut input: Vec<Range> = ranges.into_iter().collect();
        input.sort_by_key(Range::start);

        let mut merged: Vec<Range> = Vec::with_capacity(input.len());
        for range in input {
            match merged.last_mut() {
                Some(last) if last.touches(&range) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        merged.truncate(MAX_RANGES);
        Self(merged)
    }

    /// Build a list from sequence numbers, collapsing consecutive values into
    /// runs.
    #[must_use]
    pub fn from_seqs(seqs: impl IntoIterator<Item = SeqNum>) -> Self {
        Self::from_ranges(seqs.into_iter().map(Range::single))
    }

    /// Produce a fresh list holding the union of `self` and `other`.
    ///
    /// Neither input is modified.
    #[must_use]
    pub fn coalesce(&self, other: &Self) -> Self {
        Self::from_ranges(self.0.iter().chain(other.0.iter()).copied())
    }

    /// Whether any range contains `seq`.
    #[must_use]
    pub fn contains(&self, seq: SeqNum) -> bool {
        self.0
            .binary_search_by(|range| {
                if range.end < seq {
                    std::cmp::Ordering::Less
                } else if range.start > seq {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Check the ordering and size constraints on a list received from a peer.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() <= MAX_RANGES
            && self.0.iter().all(|range| range.start <= range.end)
            && self.0.windows(2).all(|pair| !pair[0].touches(&pair[1]))
    }

    /// Highest sequence number covered by the list.
    #[must_use]
    pub fn last(&self) -> Option<SeqNum> { self.0.last().map(Range::end) }

    /// Iterate over the ranges in ascending order.
    pub fn iter(&self) -> std::slice::Iter<'_, Range> { self.0.iter() }

    /// Number of ranges.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl<'a> IntoIterator for &'a RangeList {
    type Item = &'a Range;
    type IntoIter = std::slice::Iter<'a, Range>;

    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}
