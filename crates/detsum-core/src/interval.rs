//! Half-open GPS time intervals and coalesced interval sets.
//!
//! An [`Interval`] is `[start, end)` in GPS seconds. An [`IntervalSet`] keeps
//! its intervals sorted, non-overlapping, and non-adjacent (adjacent
//! intervals are merged), so the canonical form is unique per semantic set.
//! Binary operations are O(n+m) merge-scans over the already-sorted inputs.
//!
//! Boundary rules: touching endpoints (`a.end == b.start`) coalesce on
//! union but do not count as overlap for intersection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A half-open interval `[start, end)` in GPS seconds.
///
/// `start <= end` is required; a zero-length interval is valid and denotes
/// no time (it vanishes when folded into an [`IntervalSet`]).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

/// Deserialization enforces the same bounds as [`Interval::new`]: both
/// bounds finite and `start <= end`. Archives and data files are external
/// input and must not smuggle in an interval the constructor would reject.
impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            start: f64,
            end: f64,
        }
        let raw = Raw::deserialize(deserializer)?;
        if !(raw.start.is_finite() && raw.end.is_finite() && raw.start <= raw.end) {
            return Err(serde::de::Error::custom(format_args!(
                "invalid interval [{}, {})",
                raw.start, raw.end
            )));
        }
        Ok(Self { start: raw.start, end: raw.end })
    }
}

impl Interval {
    /// Create a new interval.
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or either bound is not finite. Callers build
    /// intervals from validated configuration or from other intervals, so a
    /// violation here is a programming error, not a recoverable condition.
    #[must_use]
    pub fn new(start: f64, end: f64) -> Self {
        assert!(
            start.is_finite() && end.is_finite() && start <= end,
            "invalid interval [{start}, {end})"
        );
        Self { start, end }
    }

    /// Duration of the interval in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// True if the interval covers no time.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True if `t` lies within `[start, end)`.
    #[must_use]
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }

    /// Intersection of two intervals, `None` when they do not overlap.
    ///
    /// Touching endpoints do not overlap.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (end > start).then(|| Self { start, end })
    }

    /// True if the two intervals share any time.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// An ordered, coalesced set of half-open intervals.
///
/// Invariant: for all consecutive members, `set[i].end < set[i+1].start`
/// (strict; adjacent intervals are merged on insertion), and no member is
/// empty. This makes the representation canonical: two sets covering the
/// same time compare equal.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

/// Deserialization routes through [`IntervalSet::from_intervals`], so a
/// stored list that is unsorted, overlapping, or adjacent comes back in
/// canonical form rather than as a set violating the ordering invariant.
impl<'de> Deserialize<'de> for IntervalSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self::from_intervals(Vec::<Interval>::deserialize(deserializer)?))
    }
}

impl IntervalSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self { intervals: Vec::new() }
    }

    /// Create a set covering a single interval.
    #[must_use]
    pub fn from_span(span: Interval) -> Self {
        if span.is_empty() {
            Self::new()
        } else {
            Self { intervals: vec![span] }
        }
    }

    /// Build a canonical set from an arbitrary interval list.
    ///
    /// The input may be unsorted, overlapping, adjacent, or contain empty
    /// intervals; the result is coalesced.
    #[must_use]
    pub fn from_intervals(intervals: impl IntoIterator<Item = Interval>) -> Self {
        let mut intervals: Vec<Interval> =
            intervals.into_iter().filter(|iv| !iv.is_empty()).collect();
        intervals.sort_by(|a, b| {
            a.start
                .partial_cmp(&b.start)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { intervals: coalesce_sorted(intervals) }
    }

    /// True if the set covers no time.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of disjoint intervals in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Total covered duration in seconds.
    #[must_use]
    pub fn total_duration(&self) -> f64 {
        self.intervals.iter().map(Interval::duration).sum()
    }

    /// The smallest interval containing the whole set, `None` when empty.
    #[must_use]
    pub fn extent(&self) -> Option<Interval> {
        match (self.intervals.first(), self.intervals.last()) {
            (Some(first), Some(last)) => Some(Interval::new(first.start, last.end)),
            _ => None,
        }
    }

    /// True if `t` lies within the set.
    #[must_use]
    pub fn contains(&self, t: f64) -> bool {
        // Binary search on start, then check the candidate interval.
        let idx = self
            .intervals
            .partition_point(|iv| iv.start <= t)
            .saturating_sub(1);
        self.intervals.get(idx).is_some_and(|iv| iv.contains(t))
    }

    /// True if every point of `span` is covered by the set.
    #[must_use]
    pub fn contains_span(&self, span: Interval) -> bool {
        if span.is_empty() {
            return true;
        }
        IntervalSet::from_span(span).difference(self).is_empty()
    }

    /// Iterate over the disjoint intervals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    /// View the disjoint intervals as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Interval] {
        &self.intervals
    }

    /// Union of two sets. Adjacent boundary points coalesce.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut merged = Vec::with_capacity(self.intervals.len() + other.intervals.len());
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            if self.intervals[i].start <= other.intervals[j].start {
                merged.push(self.intervals[i]);
                i += 1;
            } else {
                merged.push(other.intervals[j]);
                j += 1;
            }
        }
        merged.extend_from_slice(&self.intervals[i..]);
        merged.extend_from_slice(&other.intervals[j..]);
        Self { intervals: coalesce_sorted(merged) }
    }

    /// Intersection of two sets. Touching endpoints do not intersect.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let a = self.intervals[i];
            let b = other.intervals[j];
            if let Some(overlap) = a.intersection(&b) {
                out.push(overlap);
            }
            // Advance whichever interval ends first; it cannot overlap
            // anything later in the other set.
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { intervals: out }
    }

    /// Set difference: the parts of `self` not covered by `other`.
    ///
    /// Used both to derive NOT-flag segments (difference from a bounding
    /// span) and to find missing coverage (span minus cached coverage).
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let mut j = 0;
        for a in &self.intervals {
            let mut cursor = a.start;
            // Skip subtrahend intervals entirely before this one.
            while j < other.intervals.len() && other.intervals[j].end <= cursor {
                j += 1;
            }
            let mut k = j;
            while k < other.intervals.len() && other.intervals[k].start < a.end {
                let b = other.intervals[k];
                if b.start > cursor {
                    out.push(Interval::new(cursor, b.start));
                }
                cursor = cursor.max(b.end);
                if b.end >= a.end {
                    break;
                }
                k += 1;
            }
            if cursor < a.end {
                out.push(Interval::new(cursor, a.end));
            }
        }
        Self { intervals: out }
    }

    /// Intersection of the set with a single bounding span.
    #[must_use]
    pub fn intersect_span(&self, span: Interval) -> Self {
        let mut out = Vec::new();
        for iv in &self.intervals {
            if iv.start >= span.end {
                break;
            }
            if let Some(overlap) = iv.intersection(&span) {
                out.push(overlap);
            }
        }
        Self { intervals: out }
    }

    /// Complement of the set within a bounding span: `span \ self`.
    #[must_use]
    pub fn complement_within(&self, span: Interval) -> Self {
        IntervalSet::from_span(span).difference(self)
    }

    /// Fold another set into this one (in-place union).
    pub fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.intervals = other.intervals.clone();
            return;
        }
        *self = self.union(other);
    }

    /// Fold a single interval into this set.
    pub fn merge_span(&mut self, span: Interval) {
        self.merge(&Self::from_span(span));
    }
}

impl<'a> IntoIterator for &'a IntervalSet {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

impl FromIterator<Interval> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = Interval>>(iter: T) -> Self {
        Self::from_intervals(iter)
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, iv) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{iv}")?;
        }
        write!(f, "}}")
    }
}

/// Coalesce a start-sorted interval list: merge overlapping or adjacent
/// members, drop empty ones.
fn coalesce_sorted(intervals: Vec<Interval>) -> Vec<Interval> {
    let mut out: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals {
        if iv.is_empty() {
            continue;
        }
        match out.last_mut() {
            // Adjacent (start == end) merges too, keeping the set canonical.
            Some(last) if iv.start <= last.end => {
                last.end = last.end.max(iv.end);
            }
            _ => out.push(iv),
        }
    }
    out
}
