//! Data-quality flag store.
//!
//! A flag owns two interval sets: `active` (times the flag is asserted)
//! and `known` (times for which presence or absence has been
//! authoritatively determined). `active` is always a subset of `known`,
//! which is what lets the store distinguish "absent because never queried"
//! from "absent because queried and empty".

use crate::error::StaleDataError;
use crate::interval::{Interval, IntervalSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Known state of one data-quality flag.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRecord {
    active: IntervalSet,
    known: IntervalSet,
}

impl FlagRecord {
    /// Times the flag is asserted.
    #[must_use]
    pub fn active(&self) -> &IntervalSet {
        &self.active
    }

    /// Times for which the flag state has been authoritatively determined.
    #[must_use]
    pub fn known(&self) -> &IntervalSet {
        &self.known
    }

    /// True if the flag state is determined for every point of `span`.
    #[must_use]
    pub fn fully_known_over(&self, span: Interval) -> bool {
        self.known.contains_span(span)
    }
}

/// Result of a flag query: what we know, and what we do not.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagQuery {
    /// Active time within the queried span (exact over covered parts)
    pub active: IntervalSet,
    /// Sub-intervals of the span not yet known; the caller must fetch
    /// exactly these from a backend before the answer is authoritative
    pub gaps: IntervalSet,
}

impl FlagQuery {
    /// True if the query was answered with full coverage.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Store of all flags referenced by a run.
///
/// Flags are created empty on first reference and live for one process
/// invocation; the archive is the only durable representation.
#[derive(Debug, Default, Clone)]
pub struct FlagStore {
    flags: HashMap<String, FlagRecord>,
}

impl FlagStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Query a flag over a span.
    ///
    /// Returns the currently known active time within `span` and the
    /// sub-intervals of `span` not yet known. A never-queried flag yields
    /// empty active time and the whole span as gaps.
    #[must_use]
    pub fn query(&self, name: &str, span: Interval) -> FlagQuery {
        match self.flags.get(name) {
            Some(record) => FlagQuery {
                active: record.active.intersect_span(span),
                gaps: record.known.complement_within(span),
            },
            None => FlagQuery {
                active: IntervalSet::new(),
                gaps: IntervalSet::from_span(span),
            },
        }
    }

    /// Record an authoritative query result: `span` is now known, with
    /// `active` (bounded to `span`) folded into the flag's active set.
    ///
    /// Idempotent: merging the same span with the same result twice is a
    /// no-op. Merging a *different* result for an already-known sub-span is
    /// a contract violation (backend inconsistency or an out-of-date
    /// archive) and fails with [`StaleDataError`] without modifying the
    /// record.
    pub fn merge(
        &mut self,
        name: &str,
        span: Interval,
        active: &IntervalSet,
    ) -> Result<(), StaleDataError> {
        let bounded = active.intersect_span(span);
        let record = self.flags.entry(name.to_string()).or_default();

        // Where the incoming span overlaps already-known time, the two
        // active sets must agree exactly.
        let overlap = record.known.intersect_span(span);
        if !overlap.is_empty() {
            let existing = record.active.intersection(&overlap);
            let incoming = bounded.intersection(&overlap);
            if existing != incoming {
                let disputed = existing
                    .difference(&incoming)
                    .union(&incoming.difference(&existing));
                return Err(StaleDataError {
                    key: name.to_string(),
                    span: disputed.extent().unwrap_or(span),
                });
            }
        }

        record.active.merge(&bounded);
        record.known.merge_span(span);
        Ok(())
    }

    /// Look up a flag record, if the flag has ever been merged.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FlagRecord> {
        self.flags.get(name)
    }

    /// Iterate over all flags in the store.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FlagRecord)> {
        self.flags.iter().map(|(name, record)| (name.as_str(), record))
    }

    /// Number of flags ever merged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// True if no flag has ever been merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}
